//! Hub Configuration
//!
//! The TOML file describing where the hub keeps its state and which bridges
//! it supervises.
//!
//! # Locations
//!
//! 1. `BRIDGEHUB_CONFIG` if set
//! 2. `<config_dir>/bridgehub/config.toml` (e.g. `~/.config/bridgehub/config.toml`)
//!
//! # Example
//!
//! ```toml
//! storage_path = "/var/lib/bridgehub"
//! hub_identity = "hub"
//! heartbeat_interval_ms = 5000
//!
//! [[bridges]]
//! id = "living-room"
//! display_name = "Living Room"
//! kind = "worker"
//! port = 51827
//! pairing_pin = "031-45-154"
//! pairing_username = "0E:4C:2A:11:9B:70"
//! autostart_delay_seconds = 0
//! ```
//!
//! Bridge identities are only changed through [`HubConfig::add_bridge`],
//! [`HubConfig::update_bridge`] and [`HubConfig::remove_bridge`], each of
//! which re-validates the whole set before committing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading, validating or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config I/O error at {path:?}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for [`HubConfig`]
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Two bridges share an id
    #[error("duplicate bridge id: {0}")]
    DuplicateId(String),

    /// Two bridges share a port
    #[error("port {port} used by both {first} and {second}")]
    DuplicatePort {
        /// Contested port
        port: u16,
        /// First bridge using it
        first: String,
        /// Second bridge using it
        second: String,
    },

    /// A field failed validation
    #[error("invalid {field} for bridge {id}: {reason}")]
    Invalid {
        /// Bridge id
        id: String,
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// No bridge with this id
    #[error("unknown bridge: {0}")]
    UnknownBridge(String),

    /// No config directory could be determined
    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Whether a bridge runs inside the hub or as its own process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
    /// The hub's own control bridge, hosted in the hub process
    Control,
    /// A supervised child process
    #[default]
    Worker,
}

/// One configured bridge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeIdentity {
    /// Stable slug, unique across the hub
    pub id: String,
    /// Name shown to users
    pub display_name: String,
    /// Control or worker
    #[serde(default)]
    pub kind: BridgeKind,
    /// Accessory protocol port, unique across the hub
    pub port: u16,
    /// Pairing code, `###-##-###`
    pub pairing_pin: String,
    /// Pairing username, MAC-style `XX:XX:XX:XX:XX:XX`
    pub pairing_username: String,
    /// Seconds to wait before the first launch; negative disables autostart
    #[serde(default)]
    pub autostart_delay_seconds: i64,
}

impl BridgeIdentity {
    /// A worker bridge with the given id/port and generated defaults
    pub fn worker(id: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: BridgeKind::Worker,
            port,
            pairing_pin: "031-45-154".to_string(),
            pairing_username: "0E:00:00:00:00:01".to_string(),
            autostart_delay_seconds: 0,
        }
    }

    /// Whether the supervisor should run this bridge as a process
    #[must_use]
    pub fn is_supervised(&self) -> bool {
        self.kind == BridgeKind::Worker && self.autostart_delay_seconds >= 0
    }

    /// Check the identity's own fields
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            id: self.id.clone(),
            field,
            reason: reason.to_string(),
        };

        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("id", "must be a non-empty [a-z0-9-] slug"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must be non-zero"));
        }
        if !is_pairing_pin(&self.pairing_pin) {
            return Err(invalid("pairing_pin", "expected ###-##-###"));
        }
        if !is_pairing_username(&self.pairing_username) {
            return Err(invalid("pairing_username", "expected XX:XX:XX:XX:XX:XX"));
        }
        Ok(())
    }
}

fn is_pairing_pin(pin: &str) -> bool {
    let groups: Vec<&str> = pin.split('-').collect();
    groups.len() == 3
        && groups
            .iter()
            .zip([3, 2, 3])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_digit()))
}

fn is_pairing_username(username: &str) -> bool {
    let octets: Vec<&str> = username.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

fn default_hub_identity() -> String {
    "hub".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_accessory_cache_ttl_secs() -> u64 {
    30
}

/// Contents of the configuration file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Shared storage root: sockets, cache file, accessory fixtures
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Identity the hub listens under
    #[serde(default = "default_hub_identity")]
    pub hub_identity: String,

    /// Bridge heartbeat interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Optional bound on a single fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timeout_ms: Option<u64>,

    /// TTL of each bridge's flattened accessory list
    #[serde(default = "default_accessory_cache_ttl_secs")]
    pub accessory_cache_ttl_secs: u64,

    /// Configured bridges
    #[serde(default)]
    pub bridges: Vec<BridgeIdentity>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::with_storage(default_storage_path())
    }
}

impl HubConfig {
    /// Defaults rooted at `storage`
    pub fn with_storage(storage: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage.into(),
            hub_identity: default_hub_identity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            fetch_timeout_ms: None,
            accessory_cache_ttl_secs: default_accessory_cache_ttl_secs(),
            bridges: Vec::new(),
        }
    }

    /// Look up a bridge by id
    #[must_use]
    pub fn bridge(&self, id: &str) -> Option<&BridgeIdentity> {
        self.bridges.iter().find(|b| b.id == id)
    }

    /// Bridges the supervisor should run
    #[must_use]
    pub fn supervised_bridges(&self) -> Vec<BridgeIdentity> {
        self.bridges
            .iter()
            .filter(|b| b.is_supervised())
            .cloned()
            .collect()
    }

    /// Path of the persisted cache file
    #[must_use]
    pub fn cache_path(&self, identity: &str) -> PathBuf {
        self.storage_path.join(format!(".cache-{identity}.json"))
    }

    /// Path of a bridge's accessory graph fixture
    #[must_use]
    pub fn accessory_fixture_path(&self, bridge_id: &str) -> PathBuf {
        self.storage_path
            .join("accessories")
            .join(format!("{bridge_id}.json"))
    }

    /// Validate hub timings, every bridge and the uniqueness of ids and ports
    ///
    /// # Errors
    ///
    /// The first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                id: self.hub_identity.clone(),
                field: "heartbeat_interval_ms",
                reason: "must be non-zero".to_string(),
            });
        }

        let mut ids = HashSet::new();
        let mut ports: Vec<(u16, &str)> = Vec::new();

        for bridge in &self.bridges {
            bridge.validate()?;
            if bridge.id == self.hub_identity {
                return Err(ConfigError::Invalid {
                    id: bridge.id.clone(),
                    field: "id",
                    reason: "collides with the hub identity".to_string(),
                });
            }
            if !ids.insert(bridge.id.as_str()) {
                return Err(ConfigError::DuplicateId(bridge.id.clone()));
            }
            if let Some((_, first)) = ports.iter().find(|(p, _)| *p == bridge.port) {
                return Err(ConfigError::DuplicatePort {
                    port: bridge.port,
                    first: (*first).to_string(),
                    second: bridge.id.clone(),
                });
            }
            ports.push((bridge.port, &bridge.id));
        }
        Ok(())
    }

    /// Add a bridge, rejecting the change if the result is invalid
    ///
    /// # Errors
    ///
    /// Validation failure; the configuration is left unchanged.
    pub fn add_bridge(&mut self, bridge: BridgeIdentity) -> Result<(), ConfigError> {
        let mut next = self.bridges.clone();
        next.push(bridge);
        self.commit(next)
    }

    /// Replace the bridge with the same id
    ///
    /// # Errors
    ///
    /// `UnknownBridge` or a validation failure; nothing changes on error.
    pub fn update_bridge(&mut self, bridge: BridgeIdentity) -> Result<(), ConfigError> {
        let mut next = self.bridges.clone();
        let slot = next
            .iter_mut()
            .find(|b| b.id == bridge.id)
            .ok_or_else(|| ConfigError::UnknownBridge(bridge.id.clone()))?;
        *slot = bridge;
        self.commit(next)
    }

    /// Remove a bridge by id, returning it
    ///
    /// # Errors
    ///
    /// `UnknownBridge` if no bridge has this id.
    pub fn remove_bridge(&mut self, id: &str) -> Result<BridgeIdentity, ConfigError> {
        let index = self
            .bridges
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| ConfigError::UnknownBridge(id.to_string()))?;
        Ok(self.bridges.remove(index))
    }

    fn commit(&mut self, bridges: Vec<BridgeIdentity>) -> Result<(), ConfigError> {
        let candidate = Self {
            bridges,
            ..self.clone()
        };
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Apply environment overrides on top of the file contents
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(storage) = &overrides.storage_path {
            self.storage_path.clone_from(storage);
        }
        if let Some(interval) = overrides.heartbeat_interval_ms {
            self.heartbeat_interval_ms = interval;
        }
        if let Some(timeout) = overrides.fetch_timeout_ms {
            self.fetch_timeout_ms = Some(timeout);
        }
        self
    }
}

/// Values taken from the environment that beat the file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `BRIDGEHUB_STORAGE`
    pub storage_path: Option<PathBuf>,
    /// `BRIDGEHUB_HEARTBEAT_INTERVAL` (ms)
    pub heartbeat_interval_ms: Option<u64>,
    /// `BRIDGEHUB_FETCH_TIMEOUT` (ms)
    pub fetch_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Read overrides from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            storage_path: std::env::var("BRIDGEHUB_STORAGE").ok().map(PathBuf::from),
            heartbeat_interval_ms: std::env::var("BRIDGEHUB_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok()),
            fetch_timeout_ms: std::env::var("BRIDGEHUB_FETCH_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Where the loaded configuration came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file
    File(PathBuf),
    /// File did not exist; built-in defaults
    Defaults,
}

/// Default storage root: `~/.bridgehub`, or `/tmp/bridgehub` without a home
#[must_use]
pub fn default_storage_path() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from("/tmp/bridgehub"),
        |home| home.join(".bridgehub"),
    )
}

/// Default configuration file location
///
/// # Errors
///
/// `ConfigError::NoConfigDir` when neither `BRIDGEHUB_CONFIG` nor a
/// platform config directory is available.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("BRIDGEHUB_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join("bridgehub").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Load from the default location, applying environment overrides
///
/// # Errors
///
/// I/O, parse or validation errors. A missing file yields defaults.
pub fn load_config() -> Result<(HubConfig, ConfigSource), ConfigError> {
    let path = default_config_path()?;
    let (config, source) = load_config_from_path(&path)?;
    Ok((config.with_overrides(&ConfigOverrides::from_env()), source))
}

/// Load and validate the file at `path`
///
/// # Errors
///
/// I/O, parse or validation errors. A missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> Result<(HubConfig, ConfigSource), ConfigError> {
    if !path.exists() {
        debug!(path = ?path, "No config file, using defaults");
        return Ok((HubConfig::default(), ConfigSource::Defaults));
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: HubConfig = toml::from_str(&text)?;
    config.validate()?;

    info!(path = ?path, bridges = config.bridges.len(), "Loaded configuration");
    Ok((config, ConfigSource::File(path.to_path_buf())))
}

/// Validate and write `config` to `path`, creating parent directories
///
/// # Errors
///
/// Validation, serialization or I/O errors.
pub fn save_config(config: &HubConfig, path: &Path) -> Result<(), ConfigError> {
    config.validate()?;
    let text = toml::to_string_pretty(config)?;

    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;

    info!(path = ?path, "Saved configuration");
    Ok(())
}
