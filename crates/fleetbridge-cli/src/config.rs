//! Reads/writes `~/.fleetbridge/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetbridge_runtime::camera::{
    DEFAULT_ADVERTISE_ADDRESS, DEFAULT_QUEUE_CAPACITY, DEFAULT_VIDEO_PORT,
};
use fleetbridge_runtime::{BridgeConfig, CameraSettings};
use fleetbridge_types::LinkError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted bridge configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base WebSocket URL of the control server.
    #[serde(default = "default_control_url")]
    pub control_url: String,

    /// Identifies this bridge host to the control server.
    #[serde(default = "Uuid::new_v4")]
    pub client_id: Uuid,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub camera: CameraSection,

    #[serde(default)]
    pub sentry: SentrySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local datagram port the camera streams video to.
    #[serde(default = "default_video_port")]
    pub video_port: u16,

    /// LAN address advertised for the video port.
    #[serde(default = "default_advertise_address")]
    pub advertise_address: IpAddr,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("control_url", &self.control_url)
            .field("client_id", &"<redacted>")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("camera", &self.camera)
            .field("sentry", &self.sentry)
            .finish()
    }
}

fn default_control_url() -> String {
    "ws://10.29.105.201:8000/ws/client".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_video_port() -> u16 {
    DEFAULT_VIDEO_PORT
}
fn default_advertise_address() -> IpAddr {
    DEFAULT_ADVERTISE_ADDRESS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_url: default_control_url(),
            client_id: Uuid::new_v4(),
            poll_interval_ms: default_poll_interval_ms(),
            camera: CameraSection::default(),
            sentry: SentrySection::default(),
        }
    }
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            enabled: true,
            video_port: default_video_port(),
            advertise_address: default_advertise_address(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for SentrySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut bridge = BridgeConfig::new(&self.control_url, self.client_id.to_string());
        bridge.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        bridge
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            video_port: self.camera.video_port,
            advertise_address: self.camera.advertise_address,
            queue_capacity: self.camera.queue_capacity,
        }
    }
}

/// Return the path to `~/.fleetbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fleetbridge").join("config.toml")
}

/// Load `~/.fleetbridge/config.toml`, writing first-run defaults (with a
/// fresh client id) when it does not exist yet.  Environment overrides are
/// applied to the result, never persisted.
///
/// Returns the config and whether it was just created.
pub fn load_or_create() -> Result<(Config, bool), LinkError> {
    let path = config_path();
    let (mut cfg, created) = match load_from(&path)? {
        Some(cfg) => (cfg, false),
        None => {
            let cfg = Config::default();
            save_to(&cfg, &path)?;
            (cfg, true)
        }
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, created))
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, LinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| LinkError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| LinkError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `FLEETBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETBRIDGE_CONTROL_URL` | `control_url` |
/// | `FLEETBRIDGE_CLIENT_ID` | `client_id` |
/// | `FLEETBRIDGE_VIDEO_PORT` | `camera.video_port` |
/// | `FLEETBRIDGE_ADVERTISE_ADDRESS` | `camera.advertise_address` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FLEETBRIDGE_CONTROL_URL") {
        cfg.control_url = v;
    }
    if let Ok(v) = std::env::var("FLEETBRIDGE_CLIENT_ID")
        && let Ok(id) = v.parse::<Uuid>()
    {
        cfg.client_id = id;
    }
    if let Ok(v) = std::env::var("FLEETBRIDGE_VIDEO_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.camera.video_port = port;
    }
    if let Ok(v) = std::env::var("FLEETBRIDGE_ADVERTISE_ADDRESS")
        && let Ok(addr) = v.parse::<IpAddr>()
    {
        cfg.camera.advertise_address = addr;
    }
}

/// Write `cfg` to `path`, owner-only on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), LinkError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LinkError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                LinkError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| LinkError::Config(format!("failed to serialize config: {e}")))?;
    let write_err = |e: std::io::Error| LinkError::Config(format!("failed to write {}: {e}", path.display()));
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
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
