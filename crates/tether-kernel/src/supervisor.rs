//! [`ConnectionSupervisor`] – capability liveness monitor and recovery driver.
//!
//! The supervisor owns one cached [`ServiceProxy`] per tracked capability
//! and a background task that probes each of them every polling interval.
//! It acts on *transitions*, never on raw probe results:
//!
//! | Recorded state | Probe | Effect |
//! |---|---|---|
//! | Connected | fails | mark Disconnected, `attempts += 1`, one bounded [`recover`], then disconnect callbacks |
//! | Disconnected | fails | nothing |
//! | Disconnected | succeeds | mark Connected, `attempts = 0` |
//! | Connected | succeeds | nothing |
//!
//! Attempts are bounded per down-period: once `attempts` exceeds the
//! configured maximum the capability is *exhausted* and the loop stops
//! recovering it, but a later successful probe still brings it back.
//!
//! Reconnect callbacks run once per Disconnected → Connected edge, on the
//! first sweep that finds the capability Connected, however it got there
//! (same-sweep recovery, a later probe, or [`get_handle`]).  The very first
//! connection counts: every capability starts Disconnected.
//!
//! [`recover`]: ConnectionSupervisor::recover
//! [`get_handle`]: ConnectionSupervisor::get_handle

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tether_middleware::{ProxyFactory, ServiceProxy};
use tether_types::{CapabilityName, CapabilityStatus, ConnectionStatus, TetherError, TransportError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::probe_registry::{DEFAULT_CAPABILITIES, ProbeRegistry};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:9559";
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Pause between dropping a dead handle and building its replacement, so a
/// flapping endpoint is not hammered.
pub const DEFAULT_RECOVERY_PAUSE: Duration = Duration::from_secs(1);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Construction-time settings of a [`ConnectionSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// `host:port` of the robot; informational, the factory does the
    /// connecting.
    pub endpoint: String,
    pub polling_interval: Duration,
    /// Recovery attempts allowed per down-period.
    pub max_reconnect_attempts: u32,
    pub recovery_pause: Duration,
    /// Upper bound on every proxy creation, probe and subscribe call.
    pub call_timeout: Duration,
    /// Tracked capabilities, probed in this order.
    pub capabilities: Vec<CapabilityName>,
    pub probes: ProbeRegistry,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            recovery_pause: DEFAULT_RECOVERY_PAUSE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            capabilities: DEFAULT_CAPABILITIES
                .iter()
                .map(|name| CapabilityName::new(*name))
                .collect(),
            probes: ProbeRegistry::robot_defaults(),
        }
    }
}

impl SupervisorConfig {
    /// Defaults for everything but the endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities<I, C>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CapabilityName>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_recovery_pause(mut self, pause: Duration) -> Self {
        self.recovery_pause = pause;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-capability state machine
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of feeding one probe result into a [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No change in recorded state.
    Steady,
    /// Connected → Disconnected.  `attempt` is the new attempt count;
    /// `exhausted` means it exceeds the configured maximum.
    Disconnected { attempt: u32, exhausted: bool },
    /// Disconnected → Connected.
    Restored,
}

/// Recorded connection state of one capability.
///
/// Every capability starts Disconnected: nothing has been verified yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    /// Set on every edge to Connected, cleared once reconnect callbacks have
    /// run.
    reconnect_pending: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            reconnect_pending: false,
        }
    }
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Apply one probe result.
    pub fn record_probe(&mut self, healthy: bool, max_attempts: u32) -> Transition {
        match (self.status, healthy) {
            (ConnectionStatus::Connected, false) => {
                self.status = ConnectionStatus::Disconnected;
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                Transition::Disconnected {
                    attempt: self.reconnect_attempts,
                    exhausted: self.reconnect_attempts > max_attempts,
                }
            }
            (ConnectionStatus::Disconnected, true) => {
                self.status = ConnectionStatus::Connected;
                self.reconnect_attempts = 0;
                self.reconnect_pending = true;
                Transition::Restored
            }
            _ => Transition::Steady,
        }
    }

    /// A recovery attempt produced a working handle.
    pub fn record_recovered(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            self.reconnect_pending = true;
        }
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
    }

    /// `true` exactly once per edge to Connected, as long as the capability
    /// is still Connected when asked.
    pub fn take_reconnect_notice(&mut self) -> bool {
        if self.status == ConnectionStatus::Connected && self.reconnect_pending {
            self.reconnect_pending = false;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self, max_attempts: u32) -> CapabilityStatus {
        CapabilityStatus {
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            exhausted: self.status == ConnectionStatus::Disconnected
                && self.reconnect_attempts > max_attempts,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Callbacks
// ────────────────────────────────────────────────────────────────────────────

/// Future returned by a connection callback.
pub type CallbackFuture = BoxFuture<'static, Result<(), TetherError>>;

type ConnectionCallback = Arc<dyn Fn(CapabilityName) -> CallbackFuture + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum CallbackKind {
    Disconnect,
    Reconnect,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::Disconnect => write!(f, "disconnect"),
            CallbackKind::Reconnect => write!(f, "reconnect"),
        }
    }
}

fn boxed_callback<F, Fut>(callback: F) -> ConnectionCallback
where
    F: Fn(CapabilityName) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TetherError>> + Send + 'static,
{
    Arc::new(move |capability| callback(capability).boxed())
}

/// Run `callbacks` one after another in registration order.  Each runs as its
/// own task so an error or a panic is logged and the rest still run.
async fn run_callbacks(
    capability: &CapabilityName,
    kind: CallbackKind,
    callbacks: Vec<ConnectionCallback>,
) {
    for (index, callback) in callbacks.into_iter().enumerate() {
        let future = match catch_unwind(AssertUnwindSafe(|| callback(capability.clone()))) {
            Ok(future) => future,
            Err(_) => {
                error!(capability = %capability, callback = index, "{kind} callback panicked");
                continue;
            }
        };
        match tokio::spawn(future).await {
            Ok(Ok(())) => debug!(capability = %capability, callback = index, "{kind} callback done"),
            Ok(Err(e)) => {
                error!(capability = %capability, callback = index, error = %e, "error in {kind} callback")
            }
            Err(e) => {
                error!(capability = %capability, callback = index, error = %e, "{kind} callback panicked")
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    state: ConnectionState,
    handle: Option<Arc<dyn ServiceProxy>>,
    on_disconnect: Vec<ConnectionCallback>,
    on_reconnect: Vec<ConnectionCallback>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: ConnectionState::default(),
            handle: None,
            on_disconnect: Vec::new(),
            on_reconnect: Vec::new(),
        }
    }
}

/// The running loop.  Cloned out of the lock so every stopping caller can
/// wait on the same tracker.
#[derive(Clone)]
struct MonitorTask {
    generation: u64,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl MonitorTask {
    fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.tracker.is_empty()
    }
}

#[derive(Default)]
struct MonitorSlot {
    current: Option<MonitorTask>,
    generation: u64,
}

/// Maintains per-capability connection state and drives automatic recovery.
///
/// All methods take `&self` and may be called from any task, including from
/// inside callbacks run by the monitor loop.  Callbacks must not call
/// [`stop_monitoring`][Self::stop_monitoring]: the loop waits for them.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    factory: Arc<dyn ProxyFactory>,
    entries: Mutex<HashMap<CapabilityName, Entry>>,
    monitor: Mutex<MonitorSlot>,
}

impl ConnectionSupervisor {
    /// Build a supervisor.  Duplicate capability names in `config` are
    /// collapsed, keeping the first occurrence.
    pub fn new(mut config: SupervisorConfig, factory: Arc<dyn ProxyFactory>) -> Self {
        let mut seen = HashSet::new();
        config.capabilities.retain(|name| seen.insert(name.clone()));
        let entries = config
            .capabilities
            .iter()
            .map(|name| (name.clone(), Entry::new()))
            .collect();
        Self {
            config,
            factory,
            entries: Mutex::new(entries),
            monitor: Mutex::new(MonitorSlot::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Tracked capabilities in probing order.
    pub fn capabilities(&self) -> &[CapabilityName] {
        &self.config.capabilities
    }

    // -----------------------------------------------------------------------
    // Monitor lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the background polling task.  No-op while one is running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.lock_monitor();
        if monitor.current.as_ref().is_some_and(MonitorTask::is_running) {
            debug!("connection monitoring already running");
            return;
        }

        monitor.generation += 1;
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(monitor_loop(
            Arc::downgrade(self),
            token.clone(),
            self.config.polling_interval,
        ));
        tracker.close();
        monitor.current = Some(MonitorTask {
            generation: monitor.generation,
            token,
            tracker,
        });
        info!(
            endpoint = %self.config.endpoint,
            capabilities = self.config.capabilities.len(),
            interval_ms = self.config.polling_interval.as_millis() as u64,
            "connection monitoring started"
        );
    }

    /// Cancel the polling task and wait until it has exited.  No probe runs
    /// after this returns, for every caller, including concurrent ones.
    /// No-op when not running.
    pub async fn stop_monitoring(&self) {
        let task = self.lock_monitor().current.clone();
        let Some(task) = task else {
            return;
        };
        task.token.cancel();
        task.tracker.wait().await;

        let mut monitor = self.lock_monitor();
        // A restart may already have replaced the slot.
        if monitor
            .current
            .as_ref()
            .is_some_and(|current| current.generation == task.generation)
        {
            monitor.current = None;
            info!("connection monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_monitor()
            .current
            .as_ref()
            .is_some_and(MonitorTask::is_running)
    }

    /// One pass of the polling algorithm over every tracked capability.
    pub async fn run_sweep(&self) {
        self.sweep(&CancellationToken::new()).await;
    }

    // -----------------------------------------------------------------------
    // Probing and recovery
    // -----------------------------------------------------------------------

    /// Test one capability, creating its handle first if none is cached.
    ///
    /// Never fails: transport errors and timeouts are logged and reported as
    /// `false`.  A handle that fails its probe is dropped so the next probe
    /// starts from a fresh one.
    pub async fn probe_once(&self, capability: &CapabilityName) -> bool {
        let handle = match self.ensure_handle(capability).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(capability = %capability, error = %e, "connection test failed");
                return false;
            }
        };

        let outcome =
            tokio::time::timeout(self.config.call_timeout, self.config.probes.run(handle.as_ref()))
                .await;
        let reason = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "no answer within {} ms",
                self.config.call_timeout.as_millis()
            ),
        };
        let failure = TetherError::ProbeFailure {
            capability: capability.clone(),
            reason,
        };
        warn!(capability = %capability, error = %failure, "connection test failed");
        self.discard_handle(capability, &handle);
        false
    }

    /// Drop the cached handle, pause, build a new one and probe it.
    ///
    /// On success the capability is Connected with zero attempts.  Failures
    /// are logged, never returned.
    pub async fn recover(&self, capability: &CapabilityName) -> bool {
        self.recover_with(capability, &CancellationToken::new()).await
    }

    /// A live handle for `capability`, recovering it first if it is not
    /// currently Connected.
    ///
    /// # Errors
    ///
    /// * [`TetherError::UnknownCapability`] if the capability is not tracked.
    /// * [`TetherError::ConnectionUnavailable`] if recovery fails.
    pub async fn get_handle(
        &self,
        capability: &CapabilityName,
    ) -> Result<Arc<dyn ServiceProxy>, TetherError> {
        let cached = self
            .with_entry(capability, connected_handle_of)
            .ok_or_else(|| TetherError::UnknownCapability(capability.clone()))?;
        if let Some(handle) = cached {
            return Ok(handle);
        }

        if self.recover(capability).await
            && let Some(Some(handle)) = self.with_entry(capability, |e| e.handle.clone())
        {
            return Ok(handle);
        }
        Err(TetherError::ConnectionUnavailable {
            capability: capability.clone(),
        })
    }

    /// The cached handle if the capability is currently Connected.  Never
    /// recovers; `None` means "no managed handle available right now".
    pub fn connected_handle(&self, capability: &CapabilityName) -> Option<Arc<dyn ServiceProxy>> {
        self.with_entry(capability, connected_handle_of).flatten()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn is_connected(&self, capability: &CapabilityName) -> bool {
        self.with_entry(capability, |e| e.state.status == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    pub fn capability_status(&self, capability: &CapabilityName) -> Option<CapabilityStatus> {
        let max = self.config.max_reconnect_attempts;
        self.with_entry(capability, |e| e.state.snapshot(max))
    }

    /// Owned copy of every capability's status.
    pub fn status(&self) -> BTreeMap<CapabilityName, CapabilityStatus> {
        let max = self.config.max_reconnect_attempts;
        self.lock_entries()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.snapshot(max)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Callback registration
    // -----------------------------------------------------------------------

    /// Run `callback` on every future Connected → Disconnected transition of
    /// `capability`, after the bounded recovery attempt for that transition.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::UnknownCapability`] for untracked capabilities.
    pub fn add_disconnect_callback<F, Fut>(
        &self,
        capability: &CapabilityName,
        callback: F,
    ) -> Result<(), TetherError>
    where
        F: Fn(CapabilityName) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let callback = boxed_callback(callback);
        self.with_entry(capability, |e| e.on_disconnect.push(callback))
            .ok_or_else(|| TetherError::UnknownCapability(capability.clone()))
    }

    /// Run `callback` once per down-period of `capability`, on the first
    /// sweep that finds it Connected again.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::UnknownCapability`] for untracked capabilities.
    pub fn add_reconnect_callback<F, Fut>(
        &self,
        capability: &CapabilityName,
        callback: F,
    ) -> Result<(), TetherError>
    where
        F: Fn(CapabilityName) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let callback = boxed_callback(callback);
        self.with_entry(capability, |e| e.on_reconnect.push(callback))
            .ok_or_else(|| TetherError::UnknownCapability(capability.clone()))
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn sweep(&self, token: &CancellationToken) {
        for capability in &self.config.capabilities {
            if token.is_cancelled() {
                return;
            }
            self.supervise(capability, token).await;
        }
    }

    async fn supervise(&self, capability: &CapabilityName, token: &CancellationToken) {
        let healthy = self.probe_once(capability).await;
        let max = self.config.max_reconnect_attempts;
        let transition = self
            .with_entry(capability, |e| e.state.record_probe(healthy, max))
            .unwrap_or(Transition::Steady);

        match transition {
            Transition::Disconnected { attempt, exhausted } => {
                warn!(capability = %capability, attempt, "disconnect detected");
                if exhausted {
                    error!(
                        capability = %capability,
                        attempt,
                        max_attempts = max,
                        "max reconnection attempts reached; waiting for the capability to come back"
                    );
                } else if self.recover_with(capability, token).await {
                    info!(capability = %capability, "connection recovered");
                }
                let callbacks = self.callbacks(capability, CallbackKind::Disconnect);
                run_callbacks(capability, CallbackKind::Disconnect, callbacks).await;
            }
            Transition::Restored => info!(capability = %capability, "connection restored"),
            Transition::Steady => {}
        }

        let notify = self
            .with_entry(capability, |e| e.state.take_reconnect_notice())
            .unwrap_or(false);
        if notify {
            let callbacks = self.callbacks(capability, CallbackKind::Reconnect);
            run_callbacks(capability, CallbackKind::Reconnect, callbacks).await;
        }
    }

    async fn recover_with(&self, capability: &CapabilityName, token: &CancellationToken) -> bool {
        // Taking the handle out of the entry drops it once this statement ends.
        if self.with_entry(capability, |e| e.handle.take()).is_none() {
            warn!(capability = %capability, "cannot recover an untracked capability");
            return false;
        }
        info!(capability = %capability, "attempting to recover connection");

        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(self.config.recovery_pause) => {}
        }

        let handle = match self.create_handle(capability).await {
            Ok(handle) => handle,
            Err(e) => {
                let failure = TetherError::RecoveryFailure {
                    capability: capability.clone(),
                    reason: e.to_string(),
                };
                error!(capability = %capability, error = %failure, "error during connection recovery");
                return false;
            }
        };
        self.with_entry(capability, |e| e.handle = Some(handle));

        if self.probe_once(capability).await {
            self.with_entry(capability, |e| e.state.record_recovered());
            info!(capability = %capability, "successfully recovered connection");
            true
        } else {
            error!(capability = %capability, "failed to recover connection");
            false
        }
    }

    async fn ensure_handle(
        &self,
        capability: &CapabilityName,
    ) -> Result<Arc<dyn ServiceProxy>, TetherError> {
        let cached = self
            .with_entry(capability, |e| e.handle.clone())
            .ok_or_else(|| TetherError::UnknownCapability(capability.clone()))?;
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let fresh = self.create_handle(capability).await?;
        // Another task may have stored a handle while this one was connecting.
        Ok(self
            .with_entry(capability, |e| {
                e.handle.get_or_insert_with(|| Arc::clone(&fresh)).clone()
            })
            .unwrap_or(fresh))
    }

    async fn create_handle(
        &self,
        capability: &CapabilityName,
    ) -> Result<Arc<dyn ServiceProxy>, TetherError> {
        match tokio::time::timeout(self.config.call_timeout, self.factory.create(capability)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(TetherError::Transport(e)),
            Err(_) => Err(TetherError::Transport(TransportError::Timeout {
                operation: format!("create proxy for {capability}"),
                after_ms: self.config.call_timeout.as_millis() as u64,
            })),
        }
    }

    fn discard_handle(&self, capability: &CapabilityName, handle: &Arc<dyn ServiceProxy>) {
        self.with_entry(capability, |e| {
            if e.handle.as_ref().is_some_and(|cached| Arc::ptr_eq(cached, handle)) {
                e.handle = None;
            }
        });
    }

    fn callbacks(&self, capability: &CapabilityName, kind: CallbackKind) -> Vec<ConnectionCallback> {
        self.with_entry(capability, |e| match kind {
            CallbackKind::Disconnect => e.on_disconnect.clone(),
            CallbackKind::Reconnect => e.on_reconnect.clone(),
        })
        .unwrap_or_default()
    }

    fn with_entry<R>(&self, capability: &CapabilityName, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        self.lock_entries().get_mut(capability).map(f)
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CapabilityName, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_monitor(&self) -> MutexGuard<'_, MonitorSlot> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let monitor = self.monitor.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = monitor.current.take() {
            task.token.cancel();
        }
    }
}

fn connected_handle_of(entry: &mut Entry) -> Option<Arc<dyn ServiceProxy>> {
    match (&entry.state.status, &entry.handle) {
        (ConnectionStatus::Connected, Some(handle)) => Some(Arc::clone(handle)),
        _ => None,
    }
}

/// Body of the background task.  Holds only a weak reference between sweeps
/// so dropping the last supervisor handle also ends the loop.
async fn monitor_loop(
    supervisor: Weak<ConnectionSupervisor>,
    token: CancellationToken,
    interval: Duration,
) {
    loop {
        let Some(current) = supervisor.upgrade() else {
            break;
        };
        current.sweep(&token).await;
        drop(current);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("connection monitor loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tether_middleware::SimRobot;
    use tether_middleware::sim::SIM_ENDPOINT;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    /// Counts every `create` call, successful or not.
    struct CountingFactory {
        robot: SimRobot,
        creates: AtomicU32,
    }

    #[async_trait]
    impl ProxyFactory for CountingFactory {
        fn endpoint(&self) -> &str {
            SIM_ENDPOINT
        }

        async fn create(
            &self,
            capability: &CapabilityName,
        ) -> Result<Arc<dyn ServiceProxy>, TransportError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.robot.create(capability).await
        }
    }

    fn name(s: &str) -> CapabilityName {
        CapabilityName::new(s)
    }

    fn test_config(capabilities: &[&str]) -> SupervisorConfig {
        SupervisorConfig::new(SIM_ENDPOINT)
            .with_capabilities(capabilities.iter().copied())
            .with_recovery_pause(Duration::ZERO)
            .with_call_timeout(Duration::from_millis(200))
            .with_polling_interval(Duration::from_millis(10))
    }

    fn sim_supervisor(robot: &SimRobot, config: SupervisorConfig) -> Arc<ConnectionSupervisor> {
        Arc::new(ConnectionSupervisor::new(config, Arc::new(robot.clone())))
    }

    fn counting_supervisor(
        robot: &SimRobot,
        config: SupervisorConfig,
    ) -> (Arc<ConnectionSupervisor>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            robot: robot.clone(),
            creates: AtomicU32::new(0),
        });
        let supervisor = Arc::new(ConnectionSupervisor::new(config, factory.clone()));
        (supervisor, factory)
    }

    fn counter_callback(
        counter: &Arc<AtomicU32>,
    ) -> impl Fn(CapabilityName) -> futures_util::future::Ready<Result<(), TetherError>>
    + Send
    + Sync
    + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Ok(()))
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    #[test]
    fn fresh_state_is_disconnected() {
        let state = ConnectionState::default();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts(), 0);
    }

    #[test]
    fn failure_while_connected_increments_once() {
        let mut state = ConnectionState::default();
        assert_eq!(state.record_probe(true, 3), Transition::Restored);

        assert_eq!(
            state.record_probe(false, 3),
            Transition::Disconnected {
                attempt: 1,
                exhausted: false
            }
        );
        // Still down: no new transition, no extra attempt.
        assert_eq!(state.record_probe(false, 3), Transition::Steady);
        assert_eq!(state.record_probe(false, 3), Transition::Steady);
        assert_eq!(state.reconnect_attempts(), 1);
    }

    #[test]
    fn success_while_disconnected_resets_attempts() {
        let mut state = ConnectionState::default();
        state.record_probe(true, 3);
        state.record_probe(false, 3);
        assert_eq!(state.record_probe(true, 3), Transition::Restored);
        assert_eq!(state.reconnect_attempts(), 0);
        assert_eq!(state.record_probe(true, 3), Transition::Steady);
    }

    #[test]
    fn fourth_transition_without_restore_is_exhausted() {
        let mut state = ConnectionState::default();
        state.record_probe(true, 3);
        for expected in 1..=4 {
            let transition = state.record_probe(false, 3);
            assert_eq!(
                transition,
                Transition::Disconnected {
                    attempt: expected,
                    exhausted: expected > 3
                }
            );
            if expected < 4 {
                // Flap back up without a restore edge.
                state.status = ConnectionStatus::Connected;
            }
        }
        assert!(state.snapshot(3).exhausted);

        // A later success still heals it.
        assert_eq!(state.record_probe(true, 3), Transition::Restored);
        assert_eq!(state.snapshot(3).reconnect_attempts, 0);
        assert!(!state.snapshot(3).exhausted);
    }

    #[test]
    fn reconnect_notice_fires_once_per_edge_to_connected() {
        let mut state = ConnectionState::default();
        state.record_probe(true, 3);
        assert!(state.take_reconnect_notice(), "first connect counts");
        assert!(!state.take_reconnect_notice());

        state.record_probe(false, 3);
        assert!(!state.take_reconnect_notice(), "still down");
        state.record_recovered();
        assert!(state.take_reconnect_notice());
        assert!(!state.take_reconnect_notice());

        // Recovering an already Connected capability is not an edge.
        state.record_recovered();
        assert!(!state.take_reconnect_notice());
    }

    #[test]
    fn notice_waits_while_capability_is_down() {
        let mut state = ConnectionState::default();
        state.record_recovered();
        state.status = ConnectionStatus::Disconnected;
        assert!(!state.take_reconnect_notice());
        state.record_probe(true, 3);
        assert!(state.take_reconnect_notice());
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn first_sweep_connects_every_capability() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion", "ALLeds"]));
        assert!(!supervisor.is_connected(&name("ALMotion")));

        supervisor.run_sweep().await;

        let status = supervisor.status();
        assert_eq!(status.len(), 2);
        assert!(status.values().all(|s| s.is_connected() && s.reconnect_attempts == 0));
        assert_eq!(robot.call_count(&name("ALMotion"), "getSummary"), 1);
        assert_eq!(robot.call_count(&name("ALLeds"), "listGroups"), 1);
    }

    #[tokio::test]
    async fn duplicate_capabilities_are_collapsed() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion", "ALMotion"]));
        assert_eq!(supervisor.capabilities(), &[name("ALMotion")]);
    }

    #[tokio::test]
    async fn disconnect_fires_recovery_and_callbacks_once() {
        let robot = SimRobot::new();
        let motion = name("ALMotion");
        let (supervisor, factory) = counting_supervisor(&robot, test_config(&["ALMotion"]));
        let disconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_disconnect_callback(&motion, counter_callback(&disconnects))
            .unwrap();

        supervisor.run_sweep().await;
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);

        robot.fail_capability(&motion);
        supervisor.run_sweep().await;

        let status = supervisor.capability_status(&motion).unwrap();
        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        // One recovery attempt tried to build a new handle.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);

        // Further failing sweeps: no new transition, no recovery.
        supervisor.run_sweep().await;
        supervisor.run_sweep().await;
        let status = supervisor.capability_status(&motion).unwrap();
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        // Only the lazy re-creation in each probe.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn same_sweep_recovery_replaces_the_handle() {
        let robot = SimRobot::new();
        let memory = name("ALMemory");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMemory"]));
        supervisor.run_sweep().await;
        let old = supervisor.connected_handle(&memory).unwrap();

        // The service restarts between sweeps: the old handle is dead but a
        // new one works.
        robot.fail_capability(&memory);
        robot.restore_capability(&memory);

        let disconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_disconnect_callback(&memory, counter_callback(&disconnects))
            .unwrap();
        supervisor.run_sweep().await;

        assert!(supervisor.is_connected(&memory));
        assert_eq!(supervisor.capability_status(&memory).unwrap().reconnect_attempts, 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        let new = supervisor.connected_handle(&memory).unwrap();
        assert!(!Arc::ptr_eq(&old, &new), "recovery must build a new handle");
    }

    #[tokio::test]
    async fn exhausted_capability_skips_recovery_but_self_heals() {
        let robot = SimRobot::new();
        let leds = name("ALLeds");
        let config = test_config(&["ALLeds"]).with_max_reconnect_attempts(0);
        let (supervisor, factory) = counting_supervisor(&robot, config);
        let disconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_disconnect_callback(&leds, counter_callback(&disconnects))
            .unwrap();

        supervisor.run_sweep().await;
        robot.fail_capability(&leds);
        supervisor.run_sweep().await;

        let status = supervisor.capability_status(&leds).unwrap();
        assert!(status.exhausted);
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1, "callbacks still run");
        // The failed probe discarded the handle; no recovery create happened.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);

        robot.restore_capability(&leds);
        supervisor.run_sweep().await;
        let status = supervisor.capability_status(&leds).unwrap();
        assert!(status.is_connected());
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.exhausted);
    }

    #[tokio::test]
    async fn restore_does_not_run_disconnect_callbacks() {
        let robot = SimRobot::new();
        robot.set_reachable(false);
        let motion = name("ALMotion");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        let disconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_disconnect_callback(&motion, counter_callback(&disconnects))
            .unwrap();

        supervisor.run_sweep().await;
        assert!(!supervisor.is_connected(&motion));

        robot.set_reachable(true);
        supervisor.run_sweep().await;
        assert!(supervisor.is_connected(&motion));
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconnect_callbacks_run_once_per_up_edge() {
        let robot = SimRobot::new();
        let memory = name("ALMemory");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMemory"]));
        let reconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_reconnect_callback(&memory, counter_callback(&reconnects))
            .unwrap();

        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1, "first connect");
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        robot.fail_capability(&memory);
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        robot.restore_capability(&memory);
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);

        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn late_robot_triggers_reconnect_callbacks() {
        let robot = SimRobot::new();
        robot.set_reachable(false);
        let memory = name("ALMemory");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMemory"]));
        let reconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_reconnect_callback(&memory, counter_callback(&reconnects))
            .unwrap();

        supervisor.run_sweep().await;
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);

        robot.set_reachable(true);
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_handle_recovery_is_announced_on_next_sweep() {
        let robot = SimRobot::new();
        let memory = name("ALMemory");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMemory"]));
        let reconnects = Arc::new(AtomicU32::new(0));
        supervisor
            .add_reconnect_callback(&memory, counter_callback(&reconnects))
            .unwrap();

        supervisor.get_handle(&memory).await.unwrap();
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
        supervisor.run_sweep().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callbacks_are_fault_isolated_and_ordered() {
        let robot = SimRobot::new();
        let motion = name("ALMotion");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&order);
        supervisor
            .add_disconnect_callback(&motion, move |_| {
                log.lock().unwrap().push("failing");
                async { Err::<(), _>(TetherError::Config("boom".to_string())) }
            })
            .unwrap();
        let log = Arc::clone(&order);
        supervisor
            .add_disconnect_callback(
                &motion,
                move |_| -> futures_util::future::Ready<Result<(), TetherError>> {
                    log.lock().unwrap().push("panics before awaiting");
                    panic!("synchronous callback panic")
                },
            )
            .unwrap();
        let log = Arc::clone(&order);
        supervisor
            .add_disconnect_callback(&motion, move |capability| {
                log.lock().unwrap().push("panics inside task");
                async move {
                    if capability.as_str() == "ALMotion" {
                        panic!("async callback panic");
                    }
                    Ok(())
                }
            })
            .unwrap();
        let log = Arc::clone(&order);
        supervisor
            .add_disconnect_callback(&motion, move |capability| {
                let log = Arc::clone(&log);
                async move {
                    assert_eq!(capability.as_str(), "ALMotion");
                    log.lock().unwrap().push("last");
                    Ok(())
                }
            })
            .unwrap();

        supervisor.run_sweep().await;
        robot.fail_capability(&motion);
        supervisor.run_sweep().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["failing", "panics before awaiting", "panics inside task", "last"]
        );
    }

    #[tokio::test]
    async fn callback_registration_for_unknown_capability_fails() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        let counter = Arc::new(AtomicU32::new(0));
        let result = supervisor.add_disconnect_callback(&name("ghost"), counter_callback(&counter));
        assert!(matches!(result, Err(TetherError::UnknownCapability(_))));
    }

    #[tokio::test]
    async fn probe_once_never_fails_loudly() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));

        assert!(!supervisor.probe_once(&name("ghost")).await);

        robot.set_reachable(false);
        assert!(!supervisor.probe_once(&name("ALMotion")).await);

        robot.set_reachable(true);
        assert!(supervisor.probe_once(&name("ALMotion")).await);
    }

    #[tokio::test]
    async fn probe_times_out_on_slow_capability() {
        let robot = SimRobot::new();
        let config = test_config(&["ALMotion"]).with_call_timeout(Duration::from_millis(30));
        let supervisor = sim_supervisor(&robot, config);
        robot.set_latency(Duration::from_millis(300));

        assert!(!supervisor.probe_once(&name("ALMotion")).await);
    }

    #[tokio::test]
    async fn get_handle_recovers_on_demand() {
        let robot = SimRobot::new();
        let motion = name("ALMotion");
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));

        // Never swept: not Connected yet, so get_handle recovers first.
        let handle = supervisor.get_handle(&motion).await.unwrap();
        assert_eq!(handle.capability(), &motion);
        assert!(supervisor.is_connected(&motion));
    }

    #[tokio::test]
    async fn get_handle_reports_unavailable_and_unknown() {
        let robot = SimRobot::new();
        robot.set_reachable(false);
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));

        let result = supervisor.get_handle(&name("ALMotion")).await;
        assert!(matches!(
            result,
            Err(TetherError::ConnectionUnavailable { .. })
        ));

        let result = supervisor.get_handle(&name("ghost")).await;
        assert!(matches!(result, Err(TetherError::UnknownCapability(_))));
    }

    #[tokio::test]
    async fn connected_handle_never_recovers() {
        let robot = SimRobot::new();
        let (supervisor, factory) = counting_supervisor(&robot, test_config(&["ALMotion"]));
        assert!(supervisor.connected_handle(&name("ALMotion")).is_none());
        assert_eq!(factory.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_is_a_detached_copy() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        let before = supervisor.status();
        supervisor.run_sweep().await;
        assert!(!before[&name("ALMotion")].is_connected());
        assert!(supervisor.status()[&name("ALMotion")].is_connected());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_waits_for_exit() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion", "ALLeds"]));

        supervisor.start_monitoring();
        supervisor.start_monitoring();
        assert!(supervisor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop_monitoring().await;
        assert!(!supervisor.is_monitoring());
        assert!(supervisor.is_connected(&name("ALMotion")));

        let calls = robot.total_calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(robot.total_calls(), calls, "no probe may run after stop");

        // Second stop is a no-op.
        supervisor.stop_monitoring().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stops_both_wait_for_the_loop() {
        let robot = SimRobot::new();
        let config = test_config(&["ALMotion"])
            .with_polling_interval(Duration::from_millis(1))
            .with_call_timeout(Duration::from_secs(1));
        let supervisor = sim_supervisor(&robot, config);
        supervisor.run_sweep().await;
        robot.set_latency(Duration::from_millis(150));

        supervisor.start_monitoring();
        // Let the loop get into a slow probe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.stop_monitoring().await })
        };
        tokio::task::yield_now().await;
        supervisor.stop_monitoring().await;
        let calls = robot.total_calls();
        assert!(!supervisor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(robot.total_calls(), calls, "no probe may finish after stop returns");
        first.await.unwrap();
    }

    #[tokio::test]
    async fn stale_stop_does_not_clear_a_restarted_loop() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        supervisor.start_monitoring();
        let stale = supervisor.lock_monitor().current.clone().unwrap();
        stale.token.cancel();
        stale.tracker.wait().await;

        supervisor.start_monitoring();
        assert!(supervisor.is_monitoring());
        assert!(supervisor.lock_monitor().current.as_ref().unwrap().generation > stale.generation);
        supervisor.stop_monitoring().await;
        assert!(!supervisor.is_monitoring());
    }

    #[tokio::test]
    async fn monitoring_can_restart_after_stop() {
        let robot = SimRobot::new();
        let supervisor = sim_supervisor(&robot, test_config(&["ALMotion"]));
        supervisor.start_monitoring();
        supervisor.stop_monitoring().await;
        supervisor.start_monitoring();
        assert!(supervisor.is_monitoring());
        supervisor.stop_monitoring().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_while_loop_runs() {
        let robot = SimRobot::new();
        let config = test_config(&["ALMotion", "ALMemory", "ALLeds"])
            .with_polling_interval(Duration::from_millis(1));
        let supervisor = sim_supervisor(&robot, config);
        supervisor.start_monitoring();

        let mut tasks = Vec::new();
        for worker in 0..16u32 {
            let supervisor = Arc::clone(&supervisor);
            tasks.push(tokio::spawn(async move {
                let motion = CapabilityName::new("ALMotion");
                for i in 0..100u32 {
                    let _ = supervisor.is_connected(&motion);
                    let status = supervisor.status();
                    assert_eq!(status.len(), 3);
                    for snapshot in status.values() {
                        if snapshot.is_connected() {
                            assert!(!snapshot.exhausted);
                        }
                    }
                    if (i + worker) % 10 == 0 {
                        let _ = supervisor.get_handle(&motion).await;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let flapper = {
            let robot = robot.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    robot.set_reachable(i % 2 == 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                robot.set_reachable(true);
            })
        };

        for task in tasks {
            task.await.expect("reader task must not panic");
        }
        flapper.await.unwrap();
        supervisor.stop_monitoring().await;
    }
}
