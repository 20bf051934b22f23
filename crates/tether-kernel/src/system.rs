//! [`build_resilient_system`] – wires a supervisor and a subscription
//! manager together and starts monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_middleware::ProxyFactory;
use tether_types::{CapabilityName, HandlerId, TetherError};
use tracing::{info, warn};

use crate::consumer::ServiceConsumer;
use crate::subscriptions::{EventSubscriptionManager, TeardownReport};
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};

/// A running supervisor plus its attached subscription manager.
pub struct ResilientSystem {
    supervisor: Arc<ConnectionSupervisor>,
    subscriptions: Arc<EventSubscriptionManager>,
    shut_down: AtomicBool,
}

/// Build the supervisor, attach resubscription to `event_capability` and
/// start the monitor loop.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// [`TetherError::UnknownCapability`] if `event_capability` is not among
/// the configured capabilities.
pub fn build_resilient_system(
    config: SupervisorConfig,
    factory: Arc<dyn ProxyFactory>,
    event_capability: impl Into<CapabilityName>,
) -> Result<ResilientSystem, TetherError> {
    let supervisor = Arc::new(ConnectionSupervisor::new(config, factory));
    let subscriptions = Arc::new(EventSubscriptionManager::new(
        Arc::clone(&supervisor),
        event_capability,
    ));
    subscriptions.attach()?;
    supervisor.start_monitoring();
    info!(
        endpoint = %supervisor.endpoint(),
        event_capability = %subscriptions.event_capability(),
        "resilient system started"
    );
    Ok(ResilientSystem {
        supervisor,
        subscriptions,
        shut_down: AtomicBool::new(false),
    })
}

impl ResilientSystem {
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn subscriptions(&self) -> &Arc<EventSubscriptionManager> {
        &self.subscriptions
    }

    /// A consumer named `name` sharing this system's plumbing.
    pub fn consumer(&self, name: impl Into<String>) -> ServiceConsumer {
        ServiceConsumer::new(
            name,
            Arc::clone(&self.supervisor),
            Arc::clone(&self.subscriptions),
        )
    }

    /// Stop monitoring, then unsubscribe everything `handlers` hold.
    ///
    /// The loop is stopped first so no replay can race the teardown.  Only
    /// the first call does anything; later calls return an empty report.
    pub async fn shutdown(&self, handlers: &[HandlerId]) -> TeardownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return TeardownReport::default();
        }
        info!(handlers = handlers.len(), "shutting down resilient system");
        self.supervisor.stop_monitoring().await;
        let report = self.subscriptions.unsubscribe_all_for(handlers).await;
        for failure in &report.failures {
            warn!(
                event = %failure.event,
                handler = %failure.handler,
                reason = %failure.reason,
                "subscription not removed during shutdown"
            );
        }
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
