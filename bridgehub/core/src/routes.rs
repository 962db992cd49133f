//! Bridge-side RPC routes
//!
//! Everything a bridge answers on its endpoint. Handlers never fail at the
//! transport level: errors are logged and answered with `null`.
//!
//! | Path                        | Params          | Body                          |
//! |-----------------------------|-----------------|-------------------------------|
//! | `status:get`                |                 |                               |
//! | `accessories:list`          | `force`         |                               |
//! | `accessory:get`             | `uuid`, `force` |                               |
//! | `accessory:set`             | `uuid`          | `{"characteristic", "value"}` |
//! | `accessory:refresh`         | `uuid`          |                               |
//! | `accessory:snapshot`        | `uuid`          |                               |
//! | `accessory:characteristics` | `uuid`          |                               |
//! | `cache:accessories`         |                 |                               |
//! | `cache:parings`             |                 |                               |
//! | `cache:purge`               |                 |                               |
//! | `plugins:get`               |                 |                               |

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accessories::{AccessoryEngine, AccessoryError, DeviceLayout};
use crate::cache::Cache;
use crate::config::BridgeIdentity;
use crate::transport::{InboundEvent, IpcClient, IpcServer, Params, VoidEvent};

/// Route failure, rendered as a `null` reply
#[derive(Debug, Error)]
pub enum RouteError {
    /// Required parameter missing
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    /// Body did not have the expected shape
    #[error("invalid body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// Accessory operation failed
    #[error(transparent)]
    Accessory(#[from] AccessoryError),
}

/// Reply to `status:get`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge id
    pub bridge_id: String,
    /// Display name
    pub display_name: String,
    /// Accessory protocol port
    pub port: u16,
    /// Bridge process id
    pub pid: u32,
    /// Seconds since the bridge started
    pub uptime_secs: u64,
    /// Devices in the flattened list
    pub devices: usize,
}

/// Reply entry of `plugins:get`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSummary {
    /// Plugin id
    pub plugin_id: String,
    /// Devices it provides on this bridge
    pub devices: usize,
}

/// Body of `accessory:set`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetCharacteristic {
    /// Characteristic name or raw type id
    pub characteristic: String,
    /// New value; booleans become 0/1
    pub value: Value,
}

/// Data of a `room_change` event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomChange {
    /// Device uuid
    pub uuid: String,
    /// New placement
    #[serde(flatten)]
    pub layout: DeviceLayout,
}

/// Data of a `log` event forwarded from a bridge
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogLine {
    /// Originating bridge
    pub bridge_id: String,
    /// `warn` or `error`
    pub level: String,
    /// Message text
    pub message: String,
}

/// State shared by a bridge's route handlers
pub struct BridgeContext {
    identity: RwLock<BridgeIdentity>,
    engine: Arc<AccessoryEngine>,
    cache: Arc<Cache>,
    started: Instant,
    restart: Notify,
    hub: Option<(Arc<IpcClient>, String)>,
}

impl BridgeContext {
    /// Context for `identity` serving `engine`
    pub fn new(identity: BridgeIdentity, engine: Arc<AccessoryEngine>, cache: Arc<Cache>) -> Self {
        Self {
            identity: RwLock::new(identity),
            engine,
            cache,
            started: Instant::now(),
            restart: Notify::new(),
            hub: None,
        }
    }

    /// Push `accessory_change` and `log` events to the hub through `client`
    #[must_use]
    pub fn with_hub(mut self, client: Arc<IpcClient>, hub_identity: impl Into<String>) -> Self {
        self.hub = Some((client, hub_identity.into()));
        self
    }

    /// Current identity
    pub fn identity(&self) -> BridgeIdentity {
        self.identity.read().clone()
    }

    /// The accessory engine
    pub fn engine(&self) -> &Arc<AccessoryEngine> {
        &self.engine
    }

    /// Resolves when a `restart` event has been received
    pub async fn restart_requested(&self) {
        self.restart.notified().await;
    }

    /// Forward a warning to the hub as a `log` event
    pub async fn forward_log(&self, level: &str, message: impl Into<String>) {
        if let Some((client, hub)) = &self.hub {
            let line = LogLine {
                bridge_id: self.identity.read().id.clone(),
                level: level.to_string(),
                message: message.into(),
            };
            client.emit(hub, VoidEvent::Log, json!(line)).await;
        }
    }

    async fn status(&self) -> Result<Value, RouteError> {
        let identity = self.identity();
        let devices = self.engine.list(false).await?.len();
        Ok(json!(BridgeStatus {
            bridge_id: identity.id,
            display_name: identity.display_name,
            port: identity.port,
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            devices,
        }))
    }

    async fn plugins(&self) -> Result<Value, RouteError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for device in self.engine.list(false).await? {
            if let Some(plugin) = device.plugin_id {
                *counts.entry(plugin).or_default() += 1;
            }
        }
        let plugins: Vec<PluginSummary> = counts
            .into_iter()
            .map(|(plugin_id, devices)| PluginSummary { plugin_id, devices })
            .collect();
        Ok(json!(plugins))
    }

    async fn set(&self, params: &Params, body: Value) -> Result<Value, RouteError> {
        let uuid = param(params, "uuid")?;
        let request: SetCharacteristic = serde_json::from_value(body)?;
        let device = self
            .engine
            .set(uuid, &request.characteristic, request.value)
            .await?;

        if let Some((client, hub)) = &self.hub {
            client
                .emit(hub, VoidEvent::AccessoryChange, json!(device))
                .await;
        }
        Ok(json!(device))
    }

    async fn snapshot(&self, params: &Params) -> Result<Value, RouteError> {
        let image = self.engine.snapshot(param(params, "uuid")?).await?;
        Ok(json!({ "image": BASE64.encode(image) }))
    }

    fn purge(&self) -> Value {
        self.engine.invalidate();
        let expired = self.cache.purge_expired();
        json!({ "purged": true, "expired": expired })
    }

    fn on_event(&self, event: InboundEvent) {
        match event.event {
            VoidEvent::Restart => {
                info!("Restart requested");
                self.restart.notify_one();
            }
            VoidEvent::RoomChange => match serde_json::from_value::<RoomChange>(event.data) {
                Ok(change) => {
                    debug!(uuid = %change.uuid, room = ?change.layout.room, "Room changed");
                    self.engine.set_layout(change.uuid, change.layout);
                }
                Err(e) => warn!(error = %e, "Malformed room_change event"),
            },
            VoidEvent::ConfigChange => match serde_json::from_value::<BridgeIdentity>(event.data) {
                Ok(updated) => {
                    let mut identity = self.identity.write();
                    if updated.id == identity.id {
                        info!(display_name = %updated.display_name, "Identity updated");
                        *identity = updated;
                    }
                }
                Err(e) => warn!(error = %e, "Malformed config_change event"),
            },
            other => debug!(event = %other, "Ignoring event"),
        }
    }
}

fn param<'a>(params: &'a Params, name: &'static str) -> Result<&'a str, RouteError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or(RouteError::MissingParam(name))
}

fn flag(params: &Params, name: &str) -> bool {
    params.get(name).is_some_and(|v| v == "true" || v == "1")
}

fn render(path: &str, result: Result<Value, RouteError>) -> Value {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(path, error = %e, "Route failed");
            Value::Null
        }
    }
}

fn register<F, Fut>(server: &IpcServer, ctx: &Arc<BridgeContext>, path: &'static str, handler: F)
where
    F: Fn(Arc<BridgeContext>, Params, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RouteError>> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    server.route(path, move |params: Params, body: Value| {
        let fut = handler(Arc::clone(&ctx), params, body);
        async move { render(path, fut.await) }
    });
}

/// Register every bridge route on `server`
pub fn register_bridge_routes(server: &IpcServer, ctx: &Arc<BridgeContext>) {
    register(server, ctx, "status:get", |ctx, _, _| async move { ctx.status().await });

    register(server, ctx, "accessories:list", |ctx, params, _| async move {
        Ok(json!(ctx.engine.list(flag(&params, "force")).await?))
    });

    register(server, ctx, "accessory:get", |ctx, params, _| async move {
        let uuid = param(&params, "uuid")?;
        Ok(json!(ctx.engine.get(uuid, flag(&params, "force")).await?))
    });

    register(server, ctx, "accessory:set", |ctx, params, body| async move {
        ctx.set(&params, body).await
    });

    register(server, ctx, "accessory:refresh", |ctx, params, _| async move {
        Ok(json!(ctx.engine.refresh(param(&params, "uuid")?).await?))
    });

    register(server, ctx, "accessory:snapshot", |ctx, params, _| async move {
        ctx.snapshot(&params).await
    });

    register(server, ctx, "accessory:characteristics", |ctx, params, _| async move {
        Ok(json!(ctx.engine.characteristics(param(&params, "uuid")?).await?))
    });

    register(server, ctx, "cache:accessories", |ctx, _, _| async move {
        Ok(ctx
            .cache
            .get_value(&ctx.engine.cache_key())
            .unwrap_or_else(|| json!([])))
    });

    register(server, ctx, "cache:parings", |ctx, _, _| async move {
        Ok(ctx.engine.pairings().await?)
    });

    register(server, ctx, "cache:purge", |ctx, _, _| async move { Ok(ctx.purge()) });

    register(server, ctx, "plugins:get", |ctx, _, _| async move { ctx.plugins().await });
}

/// Apply void events delivered to `server` until it is dropped
pub fn spawn_bridge_events(server: &IpcServer, ctx: &Arc<BridgeContext>) -> JoinHandle<()> {
    let mut events = server.subscribe();
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => ctx.on_event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Bridge event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
