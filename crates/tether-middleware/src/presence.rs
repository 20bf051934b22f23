//! Presence signalling.
//!
//! Whether a person is currently engaged with the robot is shared between
//! the touch handler, the people-perception handler and the conversation
//! loop.  Rather than a process-wide flag, components receive a
//! [`PresenceBus`] explicitly and either read the current value or await
//! [`PresenceEvent`]s on a [`PresenceReceiver`].
//!
//! Built on [`tokio::sync::watch`]: receivers always observe the latest
//! value and never lag.

use std::sync::Arc;

use tether_types::PresenceEvent;
use tokio::sync::watch;
use tracing::debug;

/// Shared presence state.  Clone it cheaply; all clones share one channel.
#[derive(Clone, Debug)]
pub struct PresenceBus {
    sender: Arc<watch::Sender<bool>>,
}

impl PresenceBus {
    /// Create a bus with nobody present.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Whether a person is currently present.
    pub fn is_present(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record the current presence.
    ///
    /// Returns the [`PresenceEvent`] published to receivers, or `None` when
    /// the value did not change (receivers are not woken in that case).
    pub fn set_present(&self, present: bool) -> Option<PresenceEvent> {
        let changed = self.sender.send_if_modified(|current| {
            if *current == present {
                false
            } else {
                *current = present;
                true
            }
        });
        changed.then(|| {
            let event = event_for(present);
            debug!(?event, "presence changed");
            event
        })
    }

    /// Flip presence and return the resulting event.
    pub fn toggle(&self) -> PresenceEvent {
        let mut now_present = false;
        self.sender.send_modify(|current| {
            *current = !*current;
            now_present = *current;
        });
        let event = event_for(now_present);
        debug!(?event, "presence toggled");
        event
    }

    /// Subscribe to future presence changes.
    pub fn subscribe(&self) -> PresenceReceiver {
        PresenceReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for PresenceBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`PresenceBus`].
pub struct PresenceReceiver {
    receiver: watch::Receiver<bool>,
}

impl PresenceReceiver {
    /// Wait for the next presence change.
    ///
    /// Returns `None` once every [`PresenceBus`] clone has been dropped.
    pub async fn changed(&mut self) -> Option<PresenceEvent> {
        self.receiver.changed().await.ok()?;
        let present = *self.receiver.borrow_and_update();
        Some(event_for(present))
    }

    /// The latest value, without waiting.
    pub fn is_present(&self) -> bool {
        *self.receiver.borrow()
    }
}

fn event_for(present: bool) -> PresenceEvent {
    if present {
        PresenceEvent::Arrived
    } else {
        PresenceEvent::Left
    }
}
