//! The proxy boundary.
//!
//! Tether never speaks to the robot's RPC layer directly.  Every remote
//! capability is reached through a [`ServiceProxy`] built by a
//! [`ProxyFactory`]; the supervisor only ever holds these trait objects, so
//! swapping the WebSocket transport for the in-process simulator (or a test
//! double) does not touch the supervision logic.
//!
//! # Overview
//!
//! - [`ServiceProxy`] – a live handle to one named capability.
//! - [`ProxyFactory`] – constructs fresh handles on demand.
//! - [`RosbridgeProxyFactory`][crate::rosbridge::RosbridgeProxyFactory] –
//!   JSON `call_service` frames over a WebSocket.
//! - [`SimRobot`][crate::sim::SimRobot] – in-process robot with fault
//!   injection for tests and demos.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_types::{CapabilityName, HandlerId, TransportError};
use tokio::net::TcpStream;

/// Remote method used to register a handler for an event.
pub const SUBSCRIBE_METHOD: &str = "subscribeToEvent";

/// Remote method used to drop a handler's event registration.
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribeToEvent";

/// Bound on the plain TCP reachability check in [`ProxyFactory::ping`].
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A live handle to one remote capability.
///
/// # Contract
///
/// * `call` – invokes `method` with positional JSON `args` and returns the
///   remote result.  Implementations must not retry; retrying is the
///   supervisor's job.
///
/// * `subscribe_event` / `unsubscribe_event` – event registration on the
///   capability that carries the robot's event bus.  The provided
///   implementations go through `call`.
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// The capability this handle was created for.
    fn capability(&self) -> &CapabilityName;

    /// Invoke a remote method.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError>;

    /// Ask the remote event bus to call `handler.method` whenever `event`
    /// is raised.
    async fn subscribe_event(
        &self,
        event: &str,
        handler: &HandlerId,
        method: &str,
    ) -> Result<(), TransportError> {
        self.call(
            SUBSCRIBE_METHOD,
            vec![json!(event), json!(handler.as_str()), json!(method)],
        )
        .await
        .map(|_| ())
    }

    /// Remove `handler`'s registration for `event`.
    async fn unsubscribe_event(&self, event: &str, handler: &HandlerId) -> Result<(), TransportError> {
        self.call(UNSUBSCRIBE_METHOD, vec![json!(event), json!(handler.as_str())])
            .await
            .map(|_| ())
    }
}

/// Builds fresh [`ServiceProxy`] handles for named capabilities.
#[async_trait]
pub trait ProxyFactory: Send + Sync {
    /// `host:port` of the robot this factory connects to.
    fn endpoint(&self) -> &str;

    /// Construct a new handle.  Each call yields an independent handle; a
    /// previously created one is never reused.
    async fn create(&self, capability: &CapabilityName) -> Result<Arc<dyn ServiceProxy>, TransportError>;

    /// Check that the endpoint accepts connections at all.
    ///
    /// The default opens (and immediately drops) a TCP connection.
    async fn ping(&self) -> Result<(), TransportError> {
        let endpoint = self.endpoint().to_string();
        match tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(&endpoint)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Unreachable {
                endpoint,
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout {
                operation: format!("connect to {endpoint}"),
                after_ms: PING_TIMEOUT.as_millis() as u64,
            }),
        }
    }
}
