//! Daemon Server Implementation
//!
//! The two process roles behind the CLI:
//! - [`HubDaemon`] owns the supervisor, the hub control endpoint and the
//!   hub's cache, and reconciles children against the configuration
//! - [`BridgeDaemon`] serves one bridge's accessory graph, heartbeats the
//!   hub and exits when asked to restart
//!
//! ```text
//!                         HubDaemon  (hub.sock)
//!                             │
//!          ┌──────────────────┼──────────────────┐
//!          │ spawn/respawn    │                  │
//!     BridgeDaemon       BridgeDaemon       BridgeDaemon
//!     (den.sock)         (attic.sock)       (garage.sock)
//! ```
//!
//! Both loops poll the shutdown flag set by the signal handlers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use bridgehub_core::accessories::{accessories_cache_key, device_uuid};
use bridgehub_core::{
    load_config_from_path, register_bridge_routes, spawn_bridge_events, AccessoryEngine,
    AccessoryHost, BridgeContext, BridgeIdentity, Cache, CommandSpawner, HeartbeatConfig,
    HeartbeatEvent, HeartbeatTask, Hub, HubConfig, IpcClient, IpcServer, MemoryHost, Supervisor,
    SupervisorEvent, TransportConfig,
};

/// How often the main loops look at the signal flags
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Missed heartbeats before the bridge reports it to the hub once it is back
const HEARTBEAT_REPORT_THRESHOLD: u32 = 3;

/// The supervising hub process
pub struct HubDaemon {
    config: HubConfig,
    config_path: Option<PathBuf>,
}

impl HubDaemon {
    /// Hub for `config`, persisting management changes to `config_path`
    pub fn new(config: HubConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Run until `shutdown` is set, reloading the config whenever `reload` is
    pub async fn run(self, shutdown: Arc<AtomicBool>, reload: Arc<AtomicBool>) -> Result<()> {
        let Self {
            config,
            config_path,
        } = self;
        fs::create_dir_all(&config.storage_path)
            .with_context(|| format!("Failed to create storage directory: {:?}", config.storage_path))?;

        let identity = config.hub_identity.clone();
        let cache_path = config.cache_path(&identity);
        let cache = Arc::new(Cache::load(&cache_path));

        let transport = TransportConfig::from_hub_config(&config);
        let client = Arc::new(IpcClient::new(transport.clone()));

        let mut spawner = CommandSpawner::current_exe().context("Failed to locate own executable")?;
        if let Some(path) = &config_path {
            spawner = spawner.with_config_path(path);
        }
        let supervisor = Arc::new(Supervisor::new(Arc::new(spawner)));
        let lifecycle = spawn_lifecycle_logger(supervisor.subscribe());

        let hub = Arc::new(Hub::new(
            config,
            config_path.clone(),
            client,
            supervisor,
            Arc::clone(&cache),
        ));

        let server = IpcServer::new(identity.clone(), transport.namespace.endpoint(&identity));
        hub.register_routes(&server);
        let events = Hub::spawn_event_listener(&server);
        server
            .listen()
            .await
            .with_context(|| format!("Failed to listen on {:?}", server.socket_path()))?;
        info!(path = ?server.socket_path(), "Hub listening");

        let report = hub.start().await;
        info!(launched = ?report.launched, "Bridges started");

        while !shutdown.load(Ordering::SeqCst) {
            if reload.swap(false, Ordering::SeqCst) {
                reload_config(config_path.as_deref(), &hub).await;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        info!("Initiating graceful shutdown");
        hub.shutdown().await;
        events.abort();
        lifecycle.abort();
        server.shutdown().await;

        match cache.save(&cache_path, &[]) {
            Ok(saved) => debug!(entries = saved, path = ?cache_path, "Hub cache saved"),
            Err(e) => warn!(error = %e, path = ?cache_path, "Failed to save hub cache"),
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Re-read the config file and apply it through the hub
async fn reload_config(config_path: Option<&Path>, hub: &Hub) {
    let Some(path) = config_path else {
        info!("No config file specified, skipping reload");
        return;
    };
    info!(path = ?path, "Reloading configuration");

    let config = match load_config_from_path(path) {
        Ok((config, _)) => config,
        Err(e) => {
            error!(error = %e, path = ?path, "Reload failed, keeping current configuration");
            return;
        }
    };
    match hub.replace_config(config).await {
        Ok(report) if report.is_noop() => info!("Configuration reloaded, nothing to change"),
        Ok(report) => info!(
            launched = ?report.launched,
            torn_down = ?report.torn_down,
            "Configuration reloaded"
        ),
        Err(e) => error!(error = format!("{e:#}"), "Reload rejected"),
    }
}

/// Log every supervisor lifecycle event as one structured line
fn spawn_lifecycle_logger(mut events: broadcast::Receiver<SupervisorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::SpawnFailed { bridge_id, error }) => {
                    error!(bridge_id = %bridge_id, error = %error, "Bridge failed to start");
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => info!(event = %line, "Supervisor"),
                    Err(e) => debug!(error = %e, "Unserializable supervisor event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Lifecycle logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Why a bridge process stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeExit {
    /// A `restart` event arrived; the hub respawns us
    Restart,
    /// Signal
    Shutdown,
}

/// One bridge process
pub struct BridgeDaemon {
    config: HubConfig,
    identity: BridgeIdentity,
}

impl BridgeDaemon {
    /// Bridge `id` listening on accessory port `port`
    ///
    /// The configured identity is used when present, with the port from
    /// the command line taking precedence.
    pub fn new(config: HubConfig, id: &str, port: u16) -> Self {
        let identity = match config.bridge(id) {
            Some(identity) => BridgeIdentity {
                port,
                ..identity.clone()
            },
            None => {
                warn!(bridge_id = %id, "Bridge not in configuration, using defaults");
                BridgeIdentity::worker(id, port)
            }
        };
        Self { config, identity }
    }

    /// Identity this bridge runs as
    pub fn identity(&self) -> &BridgeIdentity {
        &self.identity
    }

    /// Accessory graph for this bridge, or an empty one if the fixture is unusable
    fn load_host(&self) -> (Arc<MemoryHost>, Option<String>) {
        let path = self.config.accessory_fixture_path(&self.identity.id);
        match MemoryHost::from_fixture(&path) {
            Ok(host) => {
                info!(path = ?path, "Loaded accessory graph");
                (Arc::new(host), None)
            }
            Err(e) => {
                let uuid = device_uuid(&self.identity.id, &self.identity.id);
                let problem = format!("accessory graph {} unusable: {e}", path.display());
                (Arc::new(MemoryHost::new(uuid, Vec::new())), Some(problem))
            }
        }
    }

    /// Serve until restart is requested or `shutdown` is set
    pub async fn run(self, shutdown: Arc<AtomicBool>) -> Result<BridgeExit> {
        let id = self.identity.id.clone();
        let span = tracing::info_span!("bridge", bridge_id = %id);
        self.serve(shutdown).instrument(span).await
    }

    async fn serve(self, shutdown: Arc<AtomicBool>) -> Result<BridgeExit> {
        let config = &self.config;
        let id = self.identity.id.clone();
        let cache_path = config.cache_path(&id);
        let cache = Arc::new(Cache::load(&cache_path));

        let (host, problem) = self.load_host();
        let host: Arc<dyn AccessoryHost> = host;
        let engine = Arc::new(
            AccessoryEngine::new(id.clone(), host, Arc::clone(&cache))
                .with_ttl(Duration::from_secs(config.accessory_cache_ttl_secs)),
        );

        let transport = TransportConfig::from_hub_config(config);
        let client = Arc::new(IpcClient::new(transport.clone()));
        let ctx = Arc::new(
            BridgeContext::new(self.identity.clone(), engine, Arc::clone(&cache))
                .with_hub(Arc::clone(&client), config.hub_identity.clone()),
        );

        let server = Arc::new(IpcServer::new(id.clone(), transport.namespace.endpoint(&id)));
        register_bridge_routes(&server, &ctx);
        let events = spawn_bridge_events(&server, &ctx);
        server
            .listen()
            .await
            .with_context(|| format!("Failed to listen on {:?}", server.socket_path()))?;
        info!(path = ?server.socket_path(), port = self.identity.port, "Bridge listening");

        if let Some(problem) = problem {
            warn!("{problem}");
            ctx.forward_log("warn", problem).await;
        }

        let (beat_tx, mut beat_rx) = mpsc::channel(8);
        let heartbeat = HeartbeatTask::new(
            HeartbeatConfig::new(config.hub_identity.clone(), transport.heartbeat_interval),
            Arc::clone(&client),
            Arc::clone(&server),
        )
        .with_events(beat_tx)
        .spawn();

        let mut missed = 0;
        let exit = loop {
            if shutdown.load(Ordering::SeqCst) {
                break BridgeExit::Shutdown;
            }
            tokio::select! {
                () = ctx.restart_requested() => break BridgeExit::Restart,
                Some(event) = beat_rx.recv() => match event {
                    HeartbeatEvent::PeerUnresponsive { missed: n, .. } => missed = n,
                    HeartbeatEvent::Healthy { .. } => {
                        if missed >= HEARTBEAT_REPORT_THRESHOLD {
                            let message = format!("hub was unreachable for {missed} heartbeats");
                            ctx.forward_log("warn", message).await;
                        }
                        missed = 0;
                    }
                },
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        info!(exit = ?exit, "Bridge shutting down");
        heartbeat.stop().await;
        events.abort();
        server.shutdown().await;
        client.close_all();

        let exclude = accessories_cache_key(&id);
        match cache.save(&cache_path, &[exclude.as_str()]) {
            Ok(saved) => debug!(entries = saved, path = ?cache_path, "Bridge cache saved"),
            Err(e) => warn!(error = %e, path = ?cache_path, "Failed to save bridge cache"),
        }

        Ok(exit)
    }
}
