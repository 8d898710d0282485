//! Configuration Vault – reads/writes `~/.vigil/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use vigil_middleware::RobotEndpoint;
use vigil_middleware::topics::DEFAULT_DETECTION_PREFIX;
use vigil_perception::DebounceConfig;
use vigil_types::{PatrolSettings, Route};

/// One robot and the broker it talks through.
#[derive(Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    pub id: String,
    pub serial: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Stored as plain text; the file is written owner-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
}

impl RobotConfig {
    pub fn endpoint(&self) -> RobotEndpoint {
        RobotEndpoint {
            robot_id: self.id.clone(),
            serial: self.serial.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
        }
    }
}

impl std::fmt::Debug for RobotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotConfig")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", redacted(&self.password))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Broker the detection pipeline publishes to.
#[derive(Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_detection_prefix")]
    pub detection_prefix: String,
    /// Smooth per-robot counts before they reach the detection gate.
    #[serde(default)]
    pub smooth_counts: bool,
    /// Extra topics to subscribe to on this broker, e.g. relayed robot
    /// status (`entity/+/status/#`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_subscriptions: Vec<String>,
}

impl CloudConfig {
    pub fn endpoint(&self) -> RobotEndpoint {
        RobotEndpoint {
            robot_id: String::new(),
            serial: String::new(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
        }
    }
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", redacted(&self.password))
            .field("use_tls", &self.use_tls)
            .field("detection_prefix", &self.detection_prefix)
            .field("smooth_counts", &self.smooth_counts)
            .field("extra_subscriptions", &self.extra_subscriptions)
            .finish()
    }
}

/// Persisted operator configuration stored in `~/.vigil/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub robots: Vec<RobotConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,

    #[serde(default)]
    pub settings: PatrolSettings,

    #[serde(default)]
    pub debounce: DebounceConfig,

    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Config {
    pub fn detection_prefix(&self) -> &str {
        self.cloud
            .as_ref()
            .map_or(DEFAULT_DETECTION_PREFIX, |c| c.detection_prefix.as_str())
    }
}

fn redacted(secret: &Option<String>) -> &'static dyn std::fmt::Debug {
    if secret.as_deref().is_some_and(|s| !s.is_empty()) { &"<redacted>" } else { &"<not set>" }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_detection_prefix() -> String {
    DEFAULT_DETECTION_PREFIX.to_string()
}

/// Return the path to `~/.vigil/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".vigil").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `VIGIL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VIGIL_BROKER_HOST` | `host` of every robot |
/// | `VIGIL_BROKER_PORT` | `port` of every robot |
/// | `VIGIL_CLOUD_HOST` | `cloud.host` |
/// | `VIGIL_CLOUD_PORT` | `cloud.port` |
///
/// The log format is read separately from `VIGIL_LOG_FORMAT`.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(host) = std::env::var("VIGIL_BROKER_HOST") {
        for robot in &mut cfg.robots {
            robot.host = host.clone();
        }
    }
    if let Some(port) = env_port("VIGIL_BROKER_PORT") {
        for robot in &mut cfg.robots {
            robot.port = port;
        }
    }
    if let Some(cloud) = cfg.cloud.as_mut() {
        if let Ok(host) = std::env::var("VIGIL_CLOUD_HOST") {
            cloud.host = host;
        }
        if let Some(port) = env_port("VIGIL_CLOUD_PORT") {
            cloud.port = port;
        }
    }
}

fn env_port(var: &str) -> Option<u16> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.vigil/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Broker passwords live in this file: owner read/write only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot(id: &str, password: Option<&str>) -> RobotConfig {
        RobotConfig {
            id: id.to_string(),
            serial: "001".to_string(),
            host: "broker.local".to_string(),
            port: 8883,
            username: Some("operator".to_string()),
            password: password.map(str::to_string),
            use_tls: true,
        }
    }

    #[test]
    fn debug_redacts_passwords() {
        let mut cfg = Config::default();
        cfg.robots.push(robot("temi-1", Some("hunter2")));
        cfg.cloud = Some(CloudConfig {
            host: "cloud.local".to_string(),
            port: 1883,
            username: None,
            password: Some("cloud-secret".to_string()),
            use_tls: false,
            detection_prefix: "safety".to_string(),
            smooth_counts: false,
            extra_subscriptions: Vec::new(),
        });
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("hunter2"));
        assert!(!debug_str.contains("cloud-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_without_password() {
        let debug_str = format!("{:?}", robot("temi-1", None));
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_robots_and_settings() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.robots.push(robot("temi-1", Some("hunter2")));
        cfg.settings.low_battery_threshold = 15;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robots.len(), 1);
        assert_eq!(loaded.robots[0].port, 8883);
        assert_eq!(loaded.robots[0].password.as_deref(), Some("hunter2"));
        assert_eq!(loaded.settings.low_battery_threshold, 15);
        assert_eq!(loaded.debounce, DebounceConfig::default());
        assert!(loaded.cloud.is_none());
    }

    #[test]
    fn hand_written_config_with_routes() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[robots]]
id = "temi-1"
serial = "00120474"

[cloud]
host = "cloud.local"
detection_prefix = "ppe"

[settings]
waypoint_timeout_secs = 90.0

[debounce]
violation_threshold = 5

[[routes]]
id = "lobby"
name = "Lobby loop"
robot_id = "temi-1"
loop_count = 0

[[routes.waypoints]]
name = "entrance"

[[routes.waypoints]]
name = "reception"
speech = "Please wear your helmet"
"#,
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.robots[0].host, "localhost");
        assert_eq!(cfg.robots[0].port, 1883);
        assert_eq!(cfg.detection_prefix(), "ppe");
        assert_eq!(cfg.settings.waypoint_timeout_secs, 90.0);
        assert_eq!(cfg.settings.waypoint_max_retries, 2);
        assert_eq!(cfg.debounce.violation_threshold, 5);
        assert_eq!(cfg.debounce.window_secs, 10.0);
        let route = &cfg.routes[0];
        assert!(route.is_infinite());
        assert_eq!(route.waypoints.len(), 2);
        assert_eq!(route.waypoints[1].speech.as_deref(), Some("Please wear your helmet"));
        assert_eq!(route.waypoints[0].dwell_secs, 5.0);
    }

    #[test]
    fn config_path_points_to_vigil_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".vigil"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn env_overrides_broker_port_and_ignores_garbage() {
        // SAFETY: no other test in this crate reads these variables.
        unsafe { std::env::set_var("VIGIL_BROKER_PORT", "9883") };
        let mut cfg = Config::default();
        cfg.robots.push(robot("temi-1", None));
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robots[0].port, 9883);

        unsafe { std::env::set_var("VIGIL_BROKER_PORT", "not-a-port") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robots[0].port, 9883);
        unsafe { std::env::remove_var("VIGIL_BROKER_PORT") };
    }

    #[test]
    fn env_overrides_cloud_host() {
        // SAFETY: no other test in this crate reads this variable.
        unsafe { std::env::set_var("VIGIL_CLOUD_HOST", "pipeline.internal") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.cloud.is_none());
        cfg.cloud = Some(CloudConfig {
            host: "cloud.local".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
            detection_prefix: "safety".to_string(),
            smooth_counts: false,
            extra_subscriptions: Vec::new(),
        });
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.cloud.as_ref().map(|c| c.host.as_str()), Some("pipeline.internal"));
        unsafe { std::env::remove_var("VIGIL_CLOUD_HOST") };
    }
}
