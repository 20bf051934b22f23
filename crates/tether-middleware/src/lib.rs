//! `tether-middleware` – The Transport Boundary
//!
//! Everything that actually touches the robot lives here; the supervision
//! core in `tether-kernel` only sees the traits.
//!
//! # Modules
//!
//! - [`proxy`] – [`ServiceProxy`] and [`ProxyFactory`]: the proxy-style RPC
//!   surface every capability is reached through.
//! - [`rosbridge`] – [`RosbridgeProxyFactory`]: JSON `call_service` frames
//!   over one WebSocket connection per handle.
//! - [`sim`] – [`SimRobot`]: an in-process robot with fault injection for
//!   tests and headless runs.
//! - [`presence`] – [`PresenceBus`]: explicit, channel-based "is someone
//!   here" signalling shared between handler modules.

pub mod presence;
pub mod proxy;
pub mod rosbridge;
pub mod sim;

pub use presence::{PresenceBus, PresenceReceiver};
pub use proxy::{ProxyFactory, ServiceProxy, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
pub use rosbridge::{RosbridgeProxy, RosbridgeProxyFactory};
pub use sim::SimRobot;
