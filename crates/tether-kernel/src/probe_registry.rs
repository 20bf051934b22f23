//! [`ProbeRegistry`] – which call proves a capability is alive.
//!
//! A liveness probe must be safe to invoke at any time purely to test
//! reachability: a read-only query with no effect on the robot.  Each
//! capability gets its own, because no single method exists on every
//! service.  Capabilities without a registered probe are considered alive as
//! soon as a handle to them can be constructed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_middleware::ServiceProxy;
use tether_types::{CapabilityName, TransportError};

/// The services of the robot that are tracked unless configured otherwise.
pub const DEFAULT_CAPABILITIES: [&str; 12] = [
    "ALTextToSpeech",
    "ALAnimatedSpeech",
    "ALBehaviorManager",
    "ALLeds",
    "ALSpeechRecognition",
    "ALTabletService",
    "PackageManager",
    "ALAutonomousLife",
    "ALMotion",
    "ALMemory",
    "ALVideoDevice",
    "ALPeoplePerception",
];

/// A side-effect-free remote call used as a liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ProbeCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Maps capability names to their liveness probes.
///
/// # Example
///
/// ```
/// use tether_kernel::probe_registry::{ProbeCall, ProbeRegistry};
/// use tether_types::CapabilityName;
///
/// let mut probes = ProbeRegistry::new();
/// probes.register(CapabilityName::new("ALMotion"), ProbeCall::new("getSummary"));
///
/// assert!(probes.probe_for(&CapabilityName::new("ALMotion")).is_some());
/// assert!(probes.probe_for(&CapabilityName::new("ALLeds")).is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProbeRegistry {
    probes: HashMap<CapabilityName, ProbeCall>,
}

impl ProbeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes for every capability in [`DEFAULT_CAPABILITIES`].
    pub fn robot_defaults() -> Self {
        let mut registry = Self::new();
        let defaults = [
            ("ALTextToSpeech", ProbeCall::new("getAvailableLanguages")),
            ("ALAnimatedSpeech", ProbeCall::new("getTagsConfiguration")),
            ("ALBehaviorManager", ProbeCall::new("getInstalledBehaviors")),
            ("ALLeds", ProbeCall::new("listGroups")),
            ("ALSpeechRecognition", ProbeCall::new("getAvailableLanguages")),
            ("ALTabletService", ProbeCall::new("robotIp")),
            ("PackageManager", ProbeCall::new("packages")),
            ("ALAutonomousLife", ProbeCall::new("getState")),
            ("ALMotion", ProbeCall::new("getSummary")),
            ("ALMemory", ProbeCall::new("getEventList")),
            ("ALVideoDevice", ProbeCall::with_args("getCameraName", vec![json!(0)])),
            ("ALPeoplePerception", ProbeCall::new("getCurrentPeriod")),
        ];
        for (name, call) in defaults {
            registry.register(CapabilityName::new(name), call);
        }
        registry
    }

    /// Register `call` as the probe for `capability`, replacing any previous
    /// probe.
    pub fn register(&mut self, capability: CapabilityName, call: ProbeCall) {
        self.probes.insert(capability, call);
    }

    /// Remove the probe for `capability`.  No-ops if none is registered.
    pub fn remove(&mut self, capability: &CapabilityName) {
        self.probes.remove(capability);
    }

    pub fn probe_for(&self, capability: &CapabilityName) -> Option<&ProbeCall> {
        self.probes.get(capability)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run the probe registered for the proxy's capability.
    ///
    /// Succeeds without any remote call when no probe is registered.
    pub async fn run(&self, proxy: &dyn ServiceProxy) -> Result<(), TransportError> {
        match self.probe_for(proxy.capability()) {
            Some(probe) => proxy
                .call(&probe.method, probe.args.clone())
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }
}
