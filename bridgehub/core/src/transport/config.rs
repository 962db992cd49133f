//! Transport Configuration
//!
//! Where endpoints live and how the client role behaves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HubConfig;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Filesystem namespace holding one socket per process identity
///
/// Other processes treat the existence of `<root>/<identity>.sock` as a
/// cheap "is this bridge up" check before they ever connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketNamespace {
    root: PathBuf,
}

impl SocketNamespace {
    /// Namespace rooted at the shared storage directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory containing the socket files
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Socket path for an identity
    #[must_use]
    pub fn endpoint(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.sock"))
    }

    /// Whether the identity currently has a socket file
    #[must_use]
    pub fn is_present(&self, identity: &str) -> bool {
        self.endpoint(identity).exists()
    }
}

/// Settings shared by the server and client roles
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Socket namespace
    pub namespace: SocketNamespace,

    /// How often the heartbeat pings its peer
    pub heartbeat_interval: Duration,

    /// Upper bound on a `fetch` round trip
    ///
    /// `None` (the default) waits for the reply indefinitely. When set,
    /// an expired wait resolves to `None` like any other transport failure.
    pub fetch_timeout: Option<Duration>,

    /// Per-connection outbound queue depth
    pub channel_capacity: usize,
}

impl TransportConfig {
    /// Configuration rooted at `storage` with defaults for everything else
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            namespace: SocketNamespace::new(storage),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            fetch_timeout: None,
            channel_capacity: 64,
        }
    }

    /// Derive transport settings from the hub configuration file
    #[must_use]
    pub fn from_hub_config(config: &HubConfig) -> Self {
        Self {
            namespace: SocketNamespace::new(config.storage_path.clone()),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            fetch_timeout: config.fetch_timeout_ms.map(Duration::from_millis),
            channel_capacity: 64,
        }
    }

    /// Override the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Bound every `fetch` by `timeout`
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_naming() {
        let ns = SocketNamespace::new("/var/lib/bridgehub");
        assert_eq!(
            ns.endpoint("living-room"),
            PathBuf::from("/var/lib/bridgehub/living-room.sock")
        );
    }

    #[test]
    fn test_presence_follows_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let ns = SocketNamespace::new(dir.path());
        assert!(!ns.is_present("garage"));

        std::fs::write(ns.endpoint("garage"), b"").unwrap();
        assert!(ns.is_present("garage"));
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::new("/tmp/bh");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(config.fetch_timeout.is_none());

        let bounded = config.with_fetch_timeout(Duration::from_millis(250));
        assert_eq!(bounded.fetch_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_hub_config() {
        let mut hub = HubConfig::with_storage("/srv/bh");
        hub.heartbeat_interval_ms = 1500;
        hub.fetch_timeout_ms = Some(2000);

        let config = TransportConfig::from_hub_config(&hub);
        assert_eq!(config.namespace.root(), Path::new("/srv/bh"));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(2)));
    }
}
