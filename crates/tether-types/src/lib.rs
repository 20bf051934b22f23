use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of a remote capability category reachable through a service proxy
/// (e.g. `"ALTextToSpeech"`, `"ALMotion"`, `"ALMemory"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityName(String);

impl CapabilityName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for CapabilityName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for CapabilityName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identity of a handler module that the remote event bus calls back into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Recorded connection state of a single capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Point-in-time snapshot of one capability's health, as reported by the
/// supervisor.  Owned by the caller; never a live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityStatus {
    pub status: ConnectionStatus,
    /// Disconnect transitions in the current down-period.
    pub reconnect_attempts: u32,
    /// `true` once `reconnect_attempts` exceeded the configured maximum;
    /// automatic recovery is skipped until the capability comes back.
    pub exhausted: bool,
}

impl CapabilityStatus {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Change in whether a person is in front of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Arrived,
    Left,
}

/// Failure reported by a transport: proxy construction, a remote call, or the
/// connection underneath it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("remote call {service} failed: {message}")]
    Remote { service: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,
}

/// Error taxonomy of the supervision layer.
///
/// Only [`TetherError::ConnectionUnavailable`] is routinely returned to
/// business logic; the other variants are logged where they occur and
/// reported through connection state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TetherError {
    #[error("probe failed for {capability}: {reason}")]
    ProbeFailure {
        capability: CapabilityName,
        reason: String,
    },

    #[error("recovery failed for {capability}: {reason}")]
    RecoveryFailure {
        capability: CapabilityName,
        reason: String,
    },

    #[error("connection to {capability} is unavailable")]
    ConnectionUnavailable { capability: CapabilityName },

    #[error("subscription to {event} failed: {reason}")]
    SubscriptionFailure { event: String, reason: String },

    #[error("capability {0} is not tracked by this supervisor")]
    UnknownCapability(CapabilityName),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),
}
