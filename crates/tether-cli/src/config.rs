//! Configuration Vault – reads/writes `~/.tether/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_kernel::{DEFAULT_CAPABILITIES, DEFAULT_EVENT_CAPABILITY, ProbeCall, ProbeRegistry, SupervisorConfig};
use tether_types::{CapabilityName, TetherError};

/// Persisted configuration stored in `~/.tether/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address of the robot.
    #[serde(default = "default_robot_ip")]
    pub robot_ip: String,

    /// Port of the robot's proxy bridge.
    #[serde(default = "default_robot_port")]
    pub robot_port: u16,

    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,

    /// Recovery attempts allowed per down-period.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_recovery_pause_ms")]
    pub recovery_pause_ms: u64,

    /// Bound on every remote call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Capability carrying the robot's event bus.
    #[serde(default = "default_event_capability")]
    pub event_capability: String,

    /// Capabilities to supervise, in probing order.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Per-capability probe overrides, e.g.
    /// `[probes.ALMotion] method = "getRobotConfig"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probes: BTreeMap<String, ProbeCall>,
}

fn default_robot_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_robot_port() -> u16 {
    9559
}
fn default_polling_interval_secs() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_recovery_pause_ms() -> u64 {
    1000
}
fn default_call_timeout_ms() -> u64 {
    3000
}
fn default_event_capability() -> String {
    DEFAULT_EVENT_CAPABILITY.to_string()
}
fn default_capabilities() -> Vec<String> {
    DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_ip: default_robot_ip(),
            robot_port: default_robot_port(),
            polling_interval_secs: default_polling_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            recovery_pause_ms: default_recovery_pause_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            event_capability: default_event_capability(),
            capabilities: default_capabilities(),
            probes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// `host:port` of the robot.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.robot_ip, self.robot_port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Built-in probes with the configured overrides applied.
    pub fn probe_registry(&self) -> ProbeRegistry {
        let mut registry = ProbeRegistry::robot_defaults();
        for (capability, call) in &self.probes {
            registry.register(CapabilityName::new(capability.as_str()), call.clone());
        }
        registry
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::new(self.endpoint())
            .with_capabilities(self.capabilities.iter().map(String::as_str))
            .with_polling_interval(Duration::from_secs(self.polling_interval_secs))
            .with_max_reconnect_attempts(self.max_reconnect_attempts)
            .with_recovery_pause(Duration::from_millis(self.recovery_pause_ms))
            .with_call_timeout(self.call_timeout())
            .with_probes(self.probe_registry())
    }
}

/// Return the path to `~/.tether/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tether").join("config.toml")
}

/// Load the config from disk and apply `TETHER_*` overrides.  Returns `None`
/// if the file does not exist.
pub fn load() -> Result<Option<Config>, TetherError> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

/// Load the config from a specific path, as written.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TetherError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TetherError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| TetherError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `TETHER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TETHER_ROBOT_IP` | `robot_ip` |
/// | `TETHER_ROBOT_PORT` | `robot_port` |
/// | `TETHER_POLL_SECS` | `polling_interval_secs` |
/// | `TETHER_MAX_RECONNECTS` | `max_reconnect_attempts` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TETHER_ROBOT_IP") {
        cfg.robot_ip = v;
    }
    if let Ok(v) = std::env::var("TETHER_ROBOT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.robot_port = port;
    }
    if let Ok(v) = std::env::var("TETHER_POLL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.polling_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("TETHER_MAX_RECONNECTS")
        && let Ok(attempts) = v.parse::<u32>()
    {
        cfg.max_reconnect_attempts = attempts;
    }
}

/// Save the config to disk, creating `~/.tether/` if necessary.
pub fn save(cfg: &Config) -> Result<(), TetherError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), TetherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TetherError::Config(format!("failed to create config directory: {e}"))
        })?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                TetherError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TetherError::Config(format!("failed to serialize config: {e}")))?;
    let write_error =
        |e: std::io::Error| TetherError::Config(format!("failed to write config at {}: {e}", path.display()));
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_error)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot_port, 9559);
        assert_eq!(loaded.polling_interval_secs, 5);
        assert_eq!(loaded.max_reconnect_attempts, 3);
        assert_eq!(loaded.event_capability, "ALMemory");
        assert_eq!(loaded.capabilities.len(), 12);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "robot_ip = \"192.168.8.204\"\ncapabilities = [\"ALMotion\", \"ALMemory\"]\n",
        )
        .unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot_ip, "192.168.8.204");
        assert_eq!(loaded.call_timeout_ms, 3000);
        assert_eq!(loaded.capabilities, vec!["ALMotion", "ALMemory"]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "robot_port = \"not a number\"").unwrap();

        assert!(matches!(load_from(&path), Err(TetherError::Config(_))));
    }

    #[test]
    fn probe_overrides_replace_builtin_probes() {
        let mut cfg = Config::default();
        cfg.probes.insert(
            "ALVideoDevice".to_string(),
            ProbeCall::with_args("getCameraName", vec![json!(1)]),
        );

        let registry = cfg.probe_registry();
        let probe = registry
            .probe_for(&CapabilityName::new("ALVideoDevice"))
            .unwrap();
        assert_eq!(probe.args, vec![json!(1)]);
        assert_eq!(registry.len(), 12);
    }

    #[test]
    fn probe_overrides_survive_a_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.probes
            .insert("ALMotion".to_string(), ProbeCall::new("getRobotConfig"));

        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.probes, cfg.probes);
    }

    #[test]
    fn supervisor_config_carries_every_setting() {
        let cfg = Config {
            robot_ip: "10.0.0.2".to_string(),
            polling_interval_secs: 2,
            recovery_pause_ms: 250,
            ..Config::default()
        };
        let sup = cfg.supervisor_config();
        assert_eq!(sup.endpoint, "10.0.0.2:9559");
        assert_eq!(sup.polling_interval, Duration::from_secs(2));
        assert_eq!(sup.recovery_pause, Duration::from_millis(250));
        assert_eq!(sup.call_timeout, Duration::from_millis(3000));
        assert_eq!(sup.capabilities.len(), 12);
    }

    #[test]
    fn config_path_points_to_tether_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".tether"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_robot_ip() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("TETHER_ROBOT_IP", "192.168.8.204") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot_ip, "192.168.8.204");
        unsafe { std::env::remove_var("TETHER_ROBOT_IP") };
    }

    #[test]
    fn apply_env_overrides_parses_or_ignores_port() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("TETHER_ROBOT_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot_port, 9559);

        unsafe { std::env::set_var("TETHER_ROBOT_PORT", "9600") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot_port, 9600);
        unsafe { std::env::remove_var("TETHER_ROBOT_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_supervision_knobs() {
        // SAFETY: no other test reads these env-vars.
        unsafe {
            std::env::set_var("TETHER_POLL_SECS", "1");
            std::env::set_var("TETHER_MAX_RECONNECTS", "7");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.polling_interval_secs, 1);
        assert_eq!(cfg.max_reconnect_attempts, 7);
        unsafe {
            std::env::remove_var("TETHER_POLL_SECS");
            std::env::remove_var("TETHER_MAX_RECONNECTS");
        }
    }
}
