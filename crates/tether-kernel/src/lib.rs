//! `tether-kernel` – Connection Supervision
//!
//! Keeps a set of remote robot capabilities usable while the robot, its
//! services or the network come and go.
//!
//! # Modules
//!
//! - [`probe_registry`] – [`ProbeRegistry`]: the side-effect-free call that
//!   proves each capability is alive.
//! - [`supervisor`] – [`ConnectionSupervisor`]: owns one handle per
//!   capability, polls them in the background, recovers on disconnect with a
//!   bounded number of attempts, and runs disconnect/reconnect callbacks
//!   exactly once per transition.
//! - [`subscriptions`] – [`EventSubscriptionManager`]: remembers event
//!   subscriptions and replays them after the event bus reconnects.
//! - [`consumer`] – [`ServiceConsumer`]: the base every robot-facing module
//!   composes; handles and subscriptions only ever come through the two
//!   above.
//! - [`diagnostics`] – [`Diagnostics`]: pre-flight reachability report with
//!   recovery recommendations.
//! - [`system`] – [`build_resilient_system`]: wires everything and starts
//!   monitoring; [`ResilientSystem::shutdown`] tears it down.

pub mod consumer;
pub mod diagnostics;
pub mod probe_registry;
pub mod subscriptions;
pub mod supervisor;
pub mod system;

pub use consumer::ServiceConsumer;
pub use diagnostics::{DiagnosticReport, Diagnostics, Issue, IssueKind, Severity};
pub use probe_registry::{DEFAULT_CAPABILITIES, ProbeCall, ProbeRegistry};
pub use subscriptions::{DEFAULT_EVENT_CAPABILITY, EventSubscriptionManager, TeardownReport};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig};
pub use system::{ResilientSystem, build_resilient_system};
