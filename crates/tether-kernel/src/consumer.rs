//! [`ServiceConsumer`] – the base every robot-facing module is built on.
//!
//! A consumer never talks to the transport directly.  It asks the
//! supervisor for handles and the subscription manager for event
//! registrations, always under its own [`HandlerId`], so its subscriptions
//! survive event-bus restarts and its teardown only touches what it owns.

use std::sync::Arc;

use tether_middleware::ServiceProxy;
use tether_types::{CapabilityName, HandlerId, TetherError};

use crate::subscriptions::EventSubscriptionManager;
use crate::supervisor::ConnectionSupervisor;

/// Shared plumbing for a named handler module.
#[derive(Clone)]
pub struct ServiceConsumer {
    name: String,
    handler: HandlerId,
    supervisor: Arc<ConnectionSupervisor>,
    subscriptions: Arc<EventSubscriptionManager>,
}

impl ServiceConsumer {
    /// `name` doubles as the handler id the event bus calls back into.
    pub fn new(
        name: impl Into<String>,
        supervisor: Arc<ConnectionSupervisor>,
        subscriptions: Arc<EventSubscriptionManager>,
    ) -> Self {
        let name = name.into();
        Self {
            handler: HandlerId::new(name.as_str()),
            name,
            supervisor,
            subscriptions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_id(&self) -> &HandlerId {
        &self.handler
    }

    /// A supervised handle, recovered on demand.
    pub async fn get_handle(
        &self,
        capability: &CapabilityName,
    ) -> Result<Arc<dyn ServiceProxy>, TetherError> {
        self.supervisor.get_handle(capability).await
    }

    /// Subscribe this consumer's `method` to `event`.
    pub async fn subscribe(&self, event: &str, method: &str) -> Result<(), TetherError> {
        self.subscriptions
            .subscribe(event, &self.handler, method)
            .await
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<(), TetherError> {
        self.subscriptions.unsubscribe(event, &self.handler).await
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }
}
