//! In-process simulated robot for tests and headless demos.
//!
//! [`SimRobot`] implements [`ProxyFactory`] without any network.  Every
//! capability answers every method with `null`, except the event-bus
//! methods, which maintain a table of subscriptions the simulated robot
//! "believes" are registered.
//!
//! Faults are injected from the outside:
//!
//! * [`SimRobot::set_reachable`] – the whole robot drops off the network.
//! * [`SimRobot::fail_capability`] – one service crashes.  Handles created
//!   before the crash stay dead even after [`SimRobot::restore_capability`];
//!   callers have to build new ones, exactly like a restarted remote module.
//!   Crashing the event-bus capability also forgets its subscriptions.
//! * [`SimRobot::set_latency`] – every call sleeps first, to exercise
//!   timeouts.
//!
//! # Example
//!
//! ```rust
//! use tether_middleware::{ProxyFactory, SimRobot};
//! use tether_types::CapabilityName;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let robot = SimRobot::new();
//! let motion = CapabilityName::new("ALMotion");
//! let proxy = robot.create(&motion).await.expect("sim create must succeed");
//! assert!(proxy.call("getSummary", vec![]).await.is_ok());
//!
//! robot.fail_capability(&motion);
//! assert!(proxy.call("getSummary", vec![]).await.is_err());
//! # });
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tether_types::{CapabilityName, HandlerId, TransportError};

use crate::proxy::{ProxyFactory, ServiceProxy, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};

/// Endpoint string reported by the simulator.
pub const SIM_ENDPOINT: &str = "sim://robot";

/// Default capability that carries the simulated event bus.
pub const SIM_EVENT_CAPABILITY: &str = "ALMemory";

#[derive(Default)]
struct SimState {
    unreachable: bool,
    latency: Duration,
    /// Crash counter per capability; a handle is alive only while its
    /// recorded generation matches.
    generations: HashMap<CapabilityName, u64>,
    failing: HashSet<CapabilityName>,
    created: HashMap<CapabilityName, u32>,
    calls: HashMap<(CapabilityName, String), u32>,
    /// event → (handler, callback method)
    subscriptions: BTreeMap<String, (HandlerId, String)>,
}

/// A simulated robot.  Clones share state.
#[derive(Clone)]
pub struct SimRobot {
    state: Arc<Mutex<SimState>>,
    event_capability: CapabilityName,
}

impl SimRobot {
    /// A reachable robot with every capability healthy.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            event_capability: CapabilityName::new(SIM_EVENT_CAPABILITY),
        }
    }

    /// Take the whole robot on or off the network.  Existing handles fail
    /// while it is unreachable and work again afterwards.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Crash `capability`.  All existing handles to it become permanently
    /// dead and new ones cannot be created until it is restored.
    pub fn fail_capability(&self, capability: &CapabilityName) {
        let mut state = self.lock();
        state.failing.insert(capability.clone());
        *state.generations.entry(capability.clone()).or_default() += 1;
        if *capability == self.event_capability {
            state.subscriptions.clear();
        }
    }

    /// Bring a crashed capability back.  Only handles created from now on
    /// will work.
    pub fn restore_capability(&self, capability: &CapabilityName) {
        self.lock().failing.remove(capability);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// How many handles have been created for `capability`.
    pub fn created_count(&self, capability: &CapabilityName) -> u32 {
        self.lock().created.get(capability).copied().unwrap_or(0)
    }

    /// How many times `method` reached `capability` (failed calls excluded).
    pub fn call_count(&self, capability: &CapabilityName, method: &str) -> u32 {
        self.lock()
            .calls
            .get(&(capability.clone(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total successful calls across all capabilities.
    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    /// Events the simulated event bus currently has a handler for.
    pub fn subscribed_events(&self) -> Vec<String> {
        self.lock().subscriptions.keys().cloned().collect()
    }

    /// The handler and method registered for `event`, if any.
    pub fn subscription(&self, event: &str) -> Option<(HandlerId, String)> {
        self.lock().subscriptions.get(event).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(
        &self,
        capability: &CapabilityName,
        generation: u64,
        method: &str,
        args: &[Value],
    ) -> Result<Value, TransportError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable {
                endpoint: SIM_ENDPOINT.to_string(),
                reason: "robot is offline".to_string(),
            });
        }
        let current = state.generations.get(capability).copied().unwrap_or(0);
        if current != generation || state.failing.contains(capability) {
            return Err(TransportError::Closed);
        }

        if *capability == self.event_capability {
            match method {
                SUBSCRIBE_METHOD => {
                    let (event, handler, callback) = match args {
                        [Value::String(e), Value::String(h), Value::String(m)] => (e, h, m),
                        _ => {
                            return Err(TransportError::Protocol(format!(
                                "{SUBSCRIBE_METHOD} expects (event, handler, method)"
                            )));
                        }
                    };
                    state
                        .subscriptions
                        .insert(event.clone(), (HandlerId::new(handler.as_str()), callback.clone()));
                }
                UNSUBSCRIBE_METHOD => {
                    let Some(Value::String(event)) = args.first() else {
                        return Err(TransportError::Protocol(format!(
                            "{UNSUBSCRIBE_METHOD} expects (event, handler)"
                        )));
                    };
                    if state.subscriptions.remove(event).is_none() {
                        return Err(TransportError::Remote {
                            service: format!("{capability}/{method}"),
                            message: format!("no subscription for {event}"),
                        });
                    }
                }
                _ => {}
            }
        }

        *state
            .calls
            .entry((capability.clone(), method.to_string()))
            .or_default() += 1;
        Ok(Value::Null)
    }
}

impl Default for SimRobot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyFactory for SimRobot {
    fn endpoint(&self) -> &str {
        SIM_ENDPOINT
    }

    async fn create(&self, capability: &CapabilityName) -> Result<Arc<dyn ServiceProxy>, TransportError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable {
                endpoint: SIM_ENDPOINT.to_string(),
                reason: "robot is offline".to_string(),
            });
        }
        if state.failing.contains(capability) {
            return Err(TransportError::Remote {
                service: capability.to_string(),
                message: "service is not registered".to_string(),
            });
        }
        *state.created.entry(capability.clone()).or_default() += 1;
        let generation = state.generations.get(capability).copied().unwrap_or(0);
        Ok(Arc::new(SimProxy {
            robot: self.clone(),
            capability: capability.clone(),
            generation,
        }))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.lock().unreachable {
            Err(TransportError::Unreachable {
                endpoint: SIM_ENDPOINT.to_string(),
                reason: "robot is offline".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

struct SimProxy {
    robot: SimRobot,
    capability: CapabilityName,
    generation: u64,
}

#[async_trait]
impl ServiceProxy for SimProxy {
    fn capability(&self) -> &CapabilityName {
        &self.capability
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let latency = self.robot.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.robot
            .dispatch(&self.capability, self.generation, method, &args)
    }
}
