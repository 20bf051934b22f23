//! Pre-flight connection diagnostics.
//!
//! [`Diagnostics`] checks a robot endpoint from the outside, with fresh
//! proxies and no supervisor involved: is the port open, does every known
//! service answer its liveness probe, does the event bus accept events, can
//! handles be created and dropped.  The resulting [`DiagnosticReport`] lists
//! issues by severity together with recovery recommendations.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tether_middleware::{ProxyFactory, ServiceProxy};
use tether_types::{CapabilityName, TetherError, TransportError};
use tracing::{error, info, warn};

use crate::probe_registry::ProbeRegistry;
use crate::subscriptions::DEFAULT_EVENT_CAPABILITY;
use crate::supervisor::DEFAULT_CALL_TIMEOUT;

/// Services the robot cannot do without.
pub const CRITICAL_SERVICES: [&str; 6] = [
    "ALTextToSpeech",
    "ALAnimatedSpeech",
    "ALBehaviorManager",
    "ALMemory",
    "ALMotion",
    "ALLeds",
];

/// Services whose absence degrades but does not stop the robot.
pub const OPTIONAL_SERVICES: [&str; 6] = [
    "ALSpeechRecognition",
    "ALTabletService",
    "PackageManager",
    "ALAutonomousLife",
    "ALVideoDevice",
    "ALPeoplePerception",
];

/// Event raised on the event bus to check it accepts events.
pub const DIAGNOSTICS_EVENT: &str = "TetherDiagnosticsEvent";

/// Capabilities created and dropped by the lifecycle check.
const LIFECYCLE_CAPABILITIES: [&str; 2] = ["ALTextToSpeech", "ALMotion"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

/// What a diagnostic [`Issue`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Unreachable,
    CriticalServices,
    OptionalServices,
    EventSystem,
    ModuleLifecycle,
}

impl IssueKind {
    fn recommendations(self) -> &'static [&'static str] {
        match self {
            IssueKind::Unreachable => &[
                "Check that the robot is powered on and has finished booting",
                "Ping the robot address to confirm network reachability",
                "Verify the configured address and port (usually 9559)",
                "Check that no firewall blocks the port",
            ],
            IssueKind::CriticalServices => &[
                "Restart the robot's service framework",
                "Reboot the robot",
                "Inspect the robot system logs for failing services",
            ],
            IssueKind::OptionalServices => &[
                "Inspect the robot system logs for failing services",
                "Disable features that depend on the missing services",
            ],
            IssueKind::EventSystem => &[
                "Keep event subscriptions behind the subscription manager so they are replayed",
                "Unsubscribe every handler on shutdown",
            ],
            IssueKind::ModuleLifecycle => &[
                "Run the connection supervisor so failed modules are detected",
                "Let the supervisor recover handles instead of caching them in modules",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Result of probing one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceCheck {
    pub capability: CapabilityName,
    pub critical: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub connectivity: bool,
    pub services: Vec<ServiceCheck>,
    pub event_system: bool,
    pub module_lifecycle: bool,
    pub issues: Vec<Issue>,
    /// De-duplicated, in the order issues were found.
    pub recommendations: Vec<String>,
}

impl DiagnosticReport {
    /// Number of issues; used as the process exit code.
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn unavailable_services(&self, critical: bool) -> Vec<&CapabilityName> {
        self.services
            .iter()
            .filter(|check| check.critical == critical && !check.available)
            .map(|check| &check.capability)
            .collect()
    }
}

/// Runs the diagnostic suite against one endpoint.
pub struct Diagnostics {
    factory: Arc<dyn ProxyFactory>,
    probes: ProbeRegistry,
    call_timeout: Duration,
    event_capability: CapabilityName,
}

impl Diagnostics {
    pub fn new(factory: Arc<dyn ProxyFactory>) -> Self {
        Self {
            factory,
            probes: ProbeRegistry::robot_defaults(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            event_capability: CapabilityName::new(DEFAULT_EVENT_CAPABILITY),
        }
    }

    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_event_capability(mut self, capability: impl Into<CapabilityName>) -> Self {
        self.event_capability = capability.into();
        self
    }

    /// Can the endpoint be reached at all.
    pub async fn check_connectivity(&self) -> Result<(), TransportError> {
        self.factory.ping().await
    }

    /// Create a fresh proxy for `capability` and run its liveness probe.
    pub async fn check_service(&self, capability: &CapabilityName) -> Result<(), TetherError> {
        let proxy = self.create(capability).await?;
        self.bounded(
            format!("probe {capability}"),
            self.probes.run(proxy.as_ref()),
        )
        .await
        .map_err(|e| TetherError::ProbeFailure {
            capability: capability.clone(),
            reason: e.to_string(),
        })
    }

    /// Raise a test event on the event bus.
    pub async fn check_event_system(&self) -> Result<(), TetherError> {
        let bus = self.create(&self.event_capability).await?;
        self.bounded(
            format!("raise {DIAGNOSTICS_EVENT}"),
            bus.call("raiseEvent", vec![json!(DIAGNOSTICS_EVENT), json!("test")]),
        )
        .await?;
        Ok(())
    }

    /// Create, use and drop a couple of handles.
    pub async fn check_module_lifecycle(&self) -> Result<(), TetherError> {
        for name in LIFECYCLE_CAPABILITIES {
            self.check_service(&CapabilityName::new(name)).await?;
        }
        Ok(())
    }

    /// Run every check and assemble the report.
    pub async fn run(&self) -> DiagnosticReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let endpoint = self.factory.endpoint().to_string();
        info!(endpoint = %endpoint, "running connection diagnostics");

        let mut issues = Vec::new();

        let connectivity = match self.check_connectivity().await {
            Ok(()) => {
                info!(endpoint = %endpoint, "basic connectivity passed");
                true
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "basic connectivity failed");
                issues.push(Issue {
                    severity: Severity::Critical,
                    kind: IssueKind::Unreachable,
                    message: format!("cannot connect to the robot at {endpoint}"),
                });
                false
            }
        };

        let mut services = Vec::new();
        for (names, critical) in [(&CRITICAL_SERVICES, true), (&OPTIONAL_SERVICES, false)] {
            for name in names {
                services.push(self.service_check(CapabilityName::new(*name), critical).await);
            }
        }
        let report_missing = |critical: bool, issues: &mut Vec<Issue>| {
            let missing: Vec<&str> = services
                .iter()
                .filter(|s| s.critical == critical && !s.available)
                .map(|s| s.capability.as_str())
                .collect();
            if missing.is_empty() {
                return;
            }
            let (severity, kind, label) = if critical {
                (Severity::Critical, IssueKind::CriticalServices, "essential")
            } else {
                (Severity::Warning, IssueKind::OptionalServices, "optional")
            };
            issues.push(Issue {
                severity,
                kind,
                message: format!("{label} services unavailable: {}", missing.join(", ")),
            });
        };
        report_missing(true, &mut issues);
        report_missing(false, &mut issues);

        let event_system = match self.check_event_system().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "event system check failed");
                issues.push(Issue {
                    severity: Severity::Warning,
                    kind: IssueKind::EventSystem,
                    message: "event subscription system may be unstable".to_string(),
                });
                false
            }
        };

        let module_lifecycle = match self.check_module_lifecycle().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "module lifecycle check failed");
                issues.push(Issue {
                    severity: Severity::Warning,
                    kind: IssueKind::ModuleLifecycle,
                    message: "module lifecycle issues detected".to_string(),
                });
                false
            }
        };

        let mut recommendations: Vec<String> = Vec::new();
        for issue in &issues {
            for text in issue.kind.recommendations() {
                if !recommendations.iter().any(|r| r == text) {
                    recommendations.push((*text).to_string());
                }
            }
        }

        let elapsed_ms = clock.elapsed().as_millis() as u64;
        if issues.is_empty() {
            info!(elapsed_ms, "diagnostics passed, no issues detected");
        } else {
            warn!(elapsed_ms, issues = issues.len(), "diagnostics found issues");
        }

        DiagnosticReport {
            endpoint,
            started_at,
            elapsed_ms,
            connectivity,
            services,
            event_system,
            module_lifecycle,
            issues,
            recommendations,
        }
    }

    async fn service_check(&self, capability: CapabilityName, critical: bool) -> ServiceCheck {
        match self.check_service(&capability).await {
            Ok(()) => {
                info!(capability = %capability, critical, "service available");
                ServiceCheck {
                    capability,
                    critical,
                    available: true,
                    error: None,
                }
            }
            Err(e) => {
                error!(capability = %capability, critical, error = %e, "service unavailable");
                ServiceCheck {
                    capability,
                    critical,
                    available: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn create(&self, capability: &CapabilityName) -> Result<Arc<dyn ServiceProxy>, TetherError> {
        let proxy = self
            .bounded(
                format!("create proxy for {capability}"),
                self.factory.create(capability),
            )
            .await?;
        Ok(proxy)
    }

    async fn bounded<T>(
        &self,
        operation: String,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation,
                after_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}
