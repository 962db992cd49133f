//! Hub Façade
//!
//! What the hub's HTTP glue calls. Device queries fan out over the
//! transport to the owning bridge; bridge management persists the
//! configuration, reconciles the supervisor and tells the bridge.
//!
//! Queries never fail: a downed bridge contributes `None` or an empty list.
//! Management operations return `anyhow::Result` so the caller can show
//! what went wrong.
//!
//! # Control routes
//!
//! The hub listens under its own identity and answers:
//! `bridge:start`, `bridge:stop`, `bridge:restart`, `bridge:purge`
//! (param `id`), `config:get`, and `config:save` (body: full config).
//! `log` events from bridges are re-logged with the bridge id.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accessories::NormalizedDevice;
use crate::cache::Cache;
use crate::config::{save_config, BridgeIdentity, HubConfig};
use crate::routes::{BridgeStatus, LogLine, SetCharacteristic};
use crate::supervisor::{ReconcileReport, Supervisor, WorkerSpec, WorkerStatus};
use crate::transport::{IpcClient, IpcServer, Params, VoidEvent};

/// One row of [`Hub::status_all`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeOverview {
    /// Configured identity
    pub identity: BridgeIdentity,
    /// Supervisor's view, if the bridge is supervised
    pub worker: Option<WorkerStatus>,
    /// Bridge's own answer, if it is reachable
    pub status: Option<BridgeStatus>,
}

/// Hub-side coordinator
pub struct Hub {
    config: RwLock<HubConfig>,
    config_path: Option<PathBuf>,
    // Serialises read-modify-save-commit across awaits
    mutations: Mutex<()>,
    client: Arc<IpcClient>,
    supervisor: Arc<Supervisor>,
    cache: Arc<Cache>,
}

fn id_params(key: &str, value: &str) -> Option<Params> {
    Some(Params::from([(key.to_string(), value.to_string())]))
}

impl Hub {
    /// Hub over `config`, persisting changes to `config_path` when set
    pub fn new(
        config: HubConfig,
        config_path: Option<PathBuf>,
        client: Arc<IpcClient>,
        supervisor: Arc<Supervisor>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            config_path,
            mutations: Mutex::new(()),
            client,
            supervisor,
            cache,
        }
    }

    /// Current configuration
    pub fn config(&self) -> HubConfig {
        self.config.read().clone()
    }

    /// The hub's process-local cache
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The supervisor
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Launch every configured worker bridge
    pub async fn start(&self) -> ReconcileReport {
        let bridges = self.config.read().bridges.clone();
        self.supervisor.reconcile(&bridges).await
    }

    /// A bridge's own status
    pub async fn bridge_status(&self, bridge_id: &str) -> Option<BridgeStatus> {
        self.client
            .fetch_as(bridge_id, "status:get", None, None)
            .await
    }

    /// Status of every configured bridge, queried concurrently
    pub async fn status_all(&self) -> Vec<BridgeOverview> {
        let bridges = self.config.read().bridges.clone();
        join_all(bridges.into_iter().map(|identity| async move {
            let status = self.bridge_status(&identity.id).await;
            let worker = self.supervisor.worker_status(&identity.id);
            BridgeOverview {
                identity,
                worker,
                status,
            }
        }))
        .await
    }

    /// Devices of one bridge; empty if it is unreachable
    pub async fn accessories(&self, bridge_id: &str, force: bool) -> Vec<NormalizedDevice> {
        let params = force.then(|| id_params("force", "true")).flatten();
        self.client
            .fetch_as(bridge_id, "accessories:list", params, None)
            .await
            .unwrap_or_default()
    }

    /// Devices of every bridge
    pub async fn all_accessories(&self) -> Vec<NormalizedDevice> {
        let ids: Vec<String> = self.config.read().bridges.iter().map(|b| b.id.clone()).collect();
        join_all(ids.iter().map(|id| self.accessories(id, false)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// One device
    pub async fn accessory(&self, bridge_id: &str, uuid: &str) -> Option<NormalizedDevice> {
        self.client
            .fetch_as::<Option<NormalizedDevice>>(bridge_id, "accessory:get", id_params("uuid", uuid), None)
            .await
            .flatten()
    }

    /// Write a characteristic; returns the refreshed device
    pub async fn set_characteristic(
        &self,
        bridge_id: &str,
        uuid: &str,
        characteristic: &str,
        value: Value,
    ) -> Option<NormalizedDevice> {
        let body = json!(SetCharacteristic {
            characteristic: characteristic.to_string(),
            value,
        });
        self.client
            .fetch_as::<Option<NormalizedDevice>>(bridge_id, "accessory:set", id_params("uuid", uuid), Some(body))
            .await
            .flatten()
    }

    /// Ask a bridge to drop its accessory cache
    pub async fn purge_bridge_cache(&self, bridge_id: &str) -> bool {
        self.client
            .fetch(bridge_id, "cache:purge", None, None)
            .await
            .is_some_and(|reply| !reply.is_null())
    }

    /// Restart a bridge process
    ///
    /// Supervised bridges are torn down and relaunched. Otherwise the
    /// bridge is sent a `restart` event.
    pub async fn restart_bridge(&self, bridge_id: &str) -> bool {
        self.client.disconnect(bridge_id);
        if self.supervisor.restart(bridge_id).await {
            return true;
        }
        if self.client.is_available(bridge_id) {
            self.client.emit(bridge_id, VoidEvent::Restart, Value::Null).await;
            return true;
        }
        false
    }

    /// Add a bridge, persist, and start it
    ///
    /// # Errors
    ///
    /// Validation or persistence failure; nothing is started.
    pub async fn add_bridge(&self, identity: BridgeIdentity) -> Result<ReconcileReport> {
        let id = identity.id.clone();
        self.mutate(|config| Ok(config.add_bridge(identity)?))
            .await
            .with_context(|| format!("adding bridge {id}"))
    }

    /// Replace a bridge's identity, persist, reconcile, and notify it
    ///
    /// # Errors
    ///
    /// Unknown id, validation or persistence failure.
    pub async fn update_bridge(&self, identity: BridgeIdentity) -> Result<ReconcileReport> {
        let id = identity.id.clone();
        let notify = identity.clone();
        let report = self
            .mutate(|config| Ok(config.update_bridge(identity)?))
            .await
            .with_context(|| format!("updating bridge {id}"))?;
        self.client
            .emit(&id, VoidEvent::ConfigChange, json!(notify))
            .await;
        Ok(report)
    }

    /// Remove a bridge, persist, and stop it
    ///
    /// # Errors
    ///
    /// Unknown id or persistence failure.
    pub async fn remove_bridge(&self, bridge_id: &str) -> Result<ReconcileReport> {
        let report = self
            .mutate(|config| {
                config.remove_bridge(bridge_id)?;
                Ok(())
            })
            .await
            .with_context(|| format!("removing bridge {bridge_id}"))?;
        self.client.disconnect(bridge_id);
        Ok(report)
    }

    /// Replace the whole configuration, as `config:save` does
    ///
    /// # Errors
    ///
    /// Validation or persistence failure.
    pub async fn replace_config(&self, config: HubConfig) -> Result<ReconcileReport> {
        config.validate().context("rejecting invalid configuration")?;
        self.mutate(move |current| {
            *current = config;
            Ok(())
        })
        .await
    }

    /// Apply `change` to a copy of the config, persist it, then commit and reconcile
    ///
    /// One mutation runs at a time, so concurrent changes never overwrite each other.
    async fn mutate<F>(&self, change: F) -> Result<ReconcileReport>
    where
        F: FnOnce(&mut HubConfig) -> Result<()>,
    {
        let _serial = self.mutations.lock().await;
        let mut next = self.config.read().clone();
        change(&mut next)?;

        if let Some(path) = &self.config_path {
            save_config(&next, path)
                .with_context(|| format!("saving configuration to {}", path.display()))?;
        }
        let bridges = next.bridges.clone();
        *self.config.write() = next;

        Ok(self.supervisor.reconcile(&bridges).await)
    }

    async fn start_bridge(&self, bridge_id: &str) -> Result<bool> {
        let Some(identity) = self.config.read().bridge(bridge_id).cloned() else {
            bail!("unknown bridge {bridge_id}");
        };
        Ok(self.supervisor.launch(WorkerSpec::new(identity.id, identity.port)))
    }

    /// Register the hub's control routes on `server`
    pub fn register_routes(self: &Arc<Self>, server: &IpcServer) {
        let hub = Arc::clone(self);
        server.route("bridge:start", move |params: Params, _body: Value| {
            let hub = Arc::clone(&hub);
            async move {
                let Some(id) = params.get("id") else {
                    return Value::Null;
                };
                match hub.start_bridge(id).await {
                    Ok(started) => json!({ "started": started }),
                    Err(e) => {
                        warn!(bridge_id = %id, error = %e, "bridge:start failed");
                        Value::Null
                    }
                }
            }
        });

        let hub = Arc::clone(self);
        server.route("bridge:stop", move |params: Params, _body: Value| {
            let hub = Arc::clone(&hub);
            async move {
                match params.get("id") {
                    Some(id) => json!({ "stopped": hub.supervisor.teardown(id).await }),
                    None => Value::Null,
                }
            }
        });

        let hub = Arc::clone(self);
        server.route("bridge:restart", move |params: Params, _body: Value| {
            let hub = Arc::clone(&hub);
            async move {
                match params.get("id") {
                    Some(id) => json!({ "restarted": hub.restart_bridge(id).await }),
                    None => Value::Null,
                }
            }
        });

        let hub = Arc::clone(self);
        server.route("bridge:purge", move |params: Params, _body: Value| {
            let hub = Arc::clone(&hub);
            async move {
                match params.get("id") {
                    Some(id) => json!({ "purged": hub.purge_bridge_cache(id).await }),
                    None => Value::Null,
                }
            }
        });

        let hub = Arc::clone(self);
        server.route("config:get", move |_params: Params, _body: Value| {
            let config = hub.config();
            async move { json!(config) }
        });

        let hub = Arc::clone(self);
        server.route("config:save", move |_params: Params, body: Value| {
            let hub = Arc::clone(&hub);
            async move {
                let config: HubConfig = match serde_json::from_value(body) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(error = %e, "config:save with malformed body");
                        return Value::Null;
                    }
                };
                match hub.replace_config(config).await {
                    Ok(report) => json!(report),
                    Err(e) => {
                        warn!(error = format!("{e:#}"), "config:save failed");
                        Value::Null
                    }
                }
            }
        });
    }

    /// Re-log `log` events and note `accessory_change` pushes from bridges
    pub fn spawn_event_listener(server: &IpcServer) -> JoinHandle<()> {
        let mut events = server.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(inbound) => match inbound.event {
                        VoidEvent::Log => match serde_json::from_value::<LogLine>(inbound.data) {
                            Ok(line) if line.level == "error" => {
                                error!(bridge_id = %line.bridge_id, "{}", line.message);
                            }
                            Ok(line) => warn!(bridge_id = %line.bridge_id, "{}", line.message),
                            Err(e) => debug!(error = %e, "Malformed log event"),
                        },
                        VoidEvent::AccessoryChange => {
                            let name = inbound.data.get("display_name").cloned().unwrap_or_default();
                            debug!(device = %name, "Accessory changed");
                        }
                        other => debug!(event = %other, "Ignoring event"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Hub event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop every worker
    pub async fn shutdown(&self) {
        info!("Stopping all bridges");
        self.supervisor.teardown_all().await;
        self.client.close_all();
    }
}
