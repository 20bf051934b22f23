//! [`EventSubscriptionManager`] – event subscriptions that outlive the
//! event-bus handle.
//!
//! Each subscription is keyed by event name and remembers the handler and
//! callback method it was made with, plus whether the transport currently
//! holds it (*active*).  Subscriptions are remembered before the remote call
//! is made, so a failed subscribe is still replayed once the event bus comes
//! back.
//!
//! After [`attach`](EventSubscriptionManager::attach) the manager follows the
//! event-bus capability on its own: a disconnect marks every subscription
//! inactive (the handle that held them is gone), a reconnect replays them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tether_types::{CapabilityName, HandlerId, TetherError, TransportError};
use tracing::{debug, error, info, warn};

use crate::supervisor::ConnectionSupervisor;

/// The capability that carries the robot's event bus.
pub const DEFAULT_EVENT_CAPABILITY: &str = "ALMemory";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Subscription {
    handler: HandlerId,
    method: String,
    active: bool,
}

/// One subscription that could not be removed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub event: String,
    pub handler: HandlerId,
    pub reason: String,
}

/// Outcome of [`EventSubscriptionManager::unsubscribe_all_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Subscriptions dropped from the registry, including failed ones.
    pub removed: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tracks `(event, handler, method)` subscriptions on the event bus and
/// replays them after the bus reconnects.
pub struct EventSubscriptionManager {
    supervisor: Arc<ConnectionSupervisor>,
    event_capability: CapabilityName,
    records: Mutex<BTreeMap<String, Subscription>>,
}

impl EventSubscriptionManager {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        event_capability: impl Into<CapabilityName>,
    ) -> Self {
        Self {
            supervisor,
            event_capability: event_capability.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn event_capability(&self) -> &CapabilityName {
        &self.event_capability
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Follow the event-bus capability: invalidate on disconnect, replay on
    /// reconnect.  The supervisor only keeps weak references to `self`.
    ///
    /// # Errors
    ///
    /// [`TetherError::UnknownCapability`] if the supervisor does not track
    /// the event-bus capability.
    pub fn attach(self: &Arc<Self>) -> Result<(), TetherError> {
        let weak = Arc::downgrade(self);
        self.supervisor
            .add_disconnect_callback(&self.event_capability, move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.mark_all_inactive();
                    }
                    Ok(())
                }
            })?;

        let weak = Arc::downgrade(self);
        self.supervisor
            .add_reconnect_callback(&self.event_capability, move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.resubscribe_all().await;
                    }
                    Ok(())
                }
            })?;

        debug!(capability = %self.event_capability, "subscription manager attached");
        Ok(())
    }

    /// Subscribe `handler.method` to `event`.
    ///
    /// The subscription is remembered even when this fails, so callers may
    /// ignore the error and rely on the next replay.
    ///
    /// # Errors
    ///
    /// [`TetherError::SubscriptionFailure`] when the event bus is unavailable
    /// or rejects the call.
    pub async fn subscribe(
        &self,
        event: &str,
        handler: &HandlerId,
        method: &str,
    ) -> Result<(), TetherError> {
        self.lock_records().insert(
            event.to_string(),
            Subscription {
                handler: handler.clone(),
                method: method.to_string(),
                active: false,
            },
        );

        match self.transport_subscribe(event, handler, method).await {
            Ok(()) => {
                self.mark_active(event, handler, method);
                info!(event, handler = %handler, method, "subscribed to event");
                Ok(())
            }
            Err(reason) => {
                let failure = TetherError::SubscriptionFailure {
                    event: event.to_string(),
                    reason,
                };
                error!(event, handler = %handler, error = %failure, "event subscription failed");
                Err(failure)
            }
        }
    }

    /// Drop `handler`'s subscription to `event`.
    ///
    /// The remote call is only made when the subscription is active and the
    /// event bus is Connected.  Bookkeeping is removed either way; a
    /// subscription held by another handler is left alone.
    ///
    /// # Errors
    ///
    /// The transport error of the remote call, after bookkeeping is gone.
    pub async fn unsubscribe(&self, event: &str, handler: &HandlerId) -> Result<(), TetherError> {
        let removed = {
            let mut records = self.lock_records();
            if records.get(event).is_some_and(|r| r.handler == *handler) {
                records.remove(event)
            } else {
                None
            }
        };
        let Some(record) = removed else {
            debug!(event, handler = %handler, "no subscription held by this handler");
            return Ok(());
        };
        if !record.active {
            debug!(event, handler = %handler, "dropped inactive subscription");
            return Ok(());
        }

        let Some(handle) = self.supervisor.connected_handle(&self.event_capability) else {
            warn!(
                event,
                capability = %self.event_capability,
                "event bus disconnected, skipping remote unsubscribe"
            );
            return Ok(());
        };

        let timeout = self.supervisor.call_timeout();
        let outcome = tokio::time::timeout(timeout, handle.unsubscribe_event(event, handler)).await;
        let error = match outcome {
            Ok(Ok(())) => {
                info!(event, handler = %handler, "unsubscribed from event");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout {
                operation: format!("unsubscribe from {event}"),
                after_ms: timeout.as_millis() as u64,
            },
        };
        warn!(event, handler = %handler, error = %error, "remote unsubscribe failed");
        Err(TetherError::Transport(error))
    }

    /// Replay every remembered subscription the transport does not hold.
    ///
    /// Returns how many were re-established.
    pub async fn resubscribe_all(&self) -> usize {
        let pending: Vec<(String, HandlerId, String)> = self
            .lock_records()
            .iter()
            .filter(|(_, r)| !r.active)
            .map(|(event, r)| (event.clone(), r.handler.clone(), r.method.clone()))
            .collect();
        if pending.is_empty() {
            return 0;
        }
        info!(count = pending.len(), "re-establishing event subscriptions");

        let mut restored = 0;
        for (event, handler, method) in pending {
            // Skip anything unsubscribed or replaced while the replay ran.
            let still_wanted = self.lock_records().get(&event).is_some_and(|r| {
                !r.active && r.handler == handler && r.method == method
            });
            if !still_wanted {
                continue;
            }
            match self.transport_subscribe(&event, &handler, &method).await {
                Ok(()) if self.mark_active(&event, &handler, &method) => restored += 1,
                Ok(()) => self.undo_stale_replay(&event, &handler).await,
                Err(reason) => {
                    error!(event = %event, handler = %handler, reason = %reason, "failed to re-subscribe")
                }
            }
        }
        info!(restored, "event subscriptions re-established");
        restored
    }

    /// Best-effort teardown of every subscription held by one of `handlers`.
    pub async fn unsubscribe_all_for(&self, handlers: &[HandlerId]) -> TeardownReport {
        let targets: Vec<(String, HandlerId)> = self
            .lock_records()
            .iter()
            .filter(|(_, r)| handlers.contains(&r.handler))
            .map(|(event, r)| (event.clone(), r.handler.clone()))
            .collect();

        let mut report = TeardownReport::default();
        for (event, handler) in targets {
            report.removed += 1;
            if let Err(e) = self.unsubscribe(&event, &handler).await {
                report.failures.push(TeardownFailure {
                    event,
                    handler,
                    reason: e.to_string(),
                });
            }
        }
        info!(
            removed = report.removed,
            failures = report.failures.len(),
            "subscription teardown finished"
        );
        report
    }

    /// Forget that the transport holds anything.  Returns how many
    /// subscriptions were active.
    pub fn mark_all_inactive(&self) -> usize {
        let mut records = self.lock_records();
        let mut count = 0;
        for record in records.values_mut().filter(|r| r.active) {
            record.active = false;
            count += 1;
        }
        if count > 0 {
            debug!(count, "subscriptions marked inactive");
        }
        count
    }

    pub fn is_active(&self, event: &str) -> bool {
        self.lock_records().get(event).is_some_and(|r| r.active)
    }

    /// Events the transport currently holds, sorted.
    pub fn active_events(&self) -> Vec<String> {
        self.lock_records()
            .iter()
            .filter(|(_, r)| r.active)
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Every event ever subscribed and not unsubscribed, sorted.
    pub fn remembered_events(&self) -> Vec<String> {
        self.lock_records().keys().cloned().collect()
    }

    async fn transport_subscribe(
        &self,
        event: &str,
        handler: &HandlerId,
        method: &str,
    ) -> Result<(), String> {
        let handle = self
            .supervisor
            .get_handle(&self.event_capability)
            .await
            .map_err(|e| e.to_string())?;
        let timeout = self.supervisor.call_timeout();
        match tokio::time::timeout(timeout, handle.subscribe_event(event, handler, method)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(TransportError::Timeout {
                operation: format!("subscribe to {event}"),
                after_ms: timeout.as_millis() as u64,
            }
            .to_string()),
        }
    }

    /// A replay landed after its record was unsubscribed.  Take the remote
    /// subscription back unless the same handler subscribed again meanwhile.
    async fn undo_stale_replay(&self, event: &str, handler: &HandlerId) {
        if self.lock_records().get(event).is_some_and(|r| r.handler == *handler) {
            return;
        }
        let Some(handle) = self.supervisor.connected_handle(&self.event_capability) else {
            return;
        };
        let timeout = self.supervisor.call_timeout();
        match tokio::time::timeout(timeout, handle.unsubscribe_event(event, handler)).await {
            Ok(Ok(())) => debug!(event, handler = %handler, "withdrew stale replayed subscription"),
            Ok(Err(e)) => warn!(event, handler = %handler, error = %e, "could not withdraw stale subscription"),
            Err(_) => warn!(event, handler = %handler, "timed out withdrawing stale subscription"),
        }
    }

    /// Mark the record active if it still describes this subscription.
    fn mark_active(&self, event: &str, handler: &HandlerId, method: &str) -> bool {
        let mut records = self.lock_records();
        match records.get_mut(event) {
            Some(record) if record.handler == *handler && record.method == method => {
                record.active = true;
                true
            }
            _ => false,
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, BTreeMap<String, Subscription>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
