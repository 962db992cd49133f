//! Bridgehub Core - Control Plane for a Fleet of Accessory Bridges
//!
//! One hub process supervises a set of child bridge processes. Each bridge
//! owns a slice of the smart-home accessory graph and exposes it, flattened
//! into a uniform device model, over a local socket RPC channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              HUB                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │  HubConfig   │──▶│  Supervisor  │   │  Hub (façade)        │  │
//! │  │ (config.toml)│   │ spawn/respawn│   │  queries + mgmt ops  │  │
//! │  └──────────────┘   └──────┬───────┘   └──────────┬───────────┘  │
//! │                            │ fork/exec            │ IpcClient    │
//! └────────────────────────────┼──────────────────────┼──────────────┘
//!                              │                      │
//!              `<storage>/<id>.sock` (length + CRC32 framed JSON)
//!                              │                      │
//! ┌────────────────────────────┼──────────────────────┼──────────────┐
//! │                        BRIDGE <id>                │              │
//! │  ┌─────────────┐   ┌───────┴──────┐   ┌───────────┴───────────┐  │
//! │  │ AccessoryHost│──▶│AccessoryEngine│──▶│ IpcServer + routes   │  │
//! │  │ (raw graph) │   │ flatten + TTL│   │ accessories:list, ... │  │
//! │  └─────────────┘   └──────┬───────┘   └───────────────────────┘  │
//! │                           │                                      │
//! │                    Cache (sealed at rest)                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`IpcServer`] / [`IpcClient`]: Session-correlated request/response and void events
//! - [`HeartbeatTask`]: Pings the peer and restarts the local endpoint on silence
//! - [`Supervisor`]: Keeps one child process per configured worker bridge alive
//! - [`AccessoryEngine`]: Cached, flattened view of one bridge's accessory graph
//! - [`NormalizedDevice`]: Uniform device record with typed capabilities
//! - [`Cache`]: TTL key/value store, persisted encrypted
//! - [`Hub`]: What the hub's outer surfaces call
//!
//! # Module Overview
//!
//! - [`transport`]: Socket endpoints, framing, envelopes, heartbeat
//! - [`supervisor`]: Worker spawning, respawn on exit, reconcile against config
//! - [`accessories`]: Raw graph model, type tables, flattening, the engine
//! - [`cache`]: TTL cache and its encrypted persistence
//! - [`config`]: Hub configuration file and bridge identities
//! - [`routes`]: The bridge-side route table and event handling
//! - [`hub`]: Hub-side fan-out, management operations, control routes

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod accessories;
pub mod cache;
pub mod config;
pub mod hub;
pub mod routes;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use accessories::{
    AccessoryEngine, AccessoryError, AccessoryHost, DeviceKind, DeviceLayout, GraphAccessory,
    MemoryHost, Mutable, NormalizedCharacteristic, NormalizedDevice, SnapshotCapable,
};
pub use cache::{Cache, CacheError};
pub use hub::{BridgeOverview, Hub};
pub use routes::{register_bridge_routes, spawn_bridge_events, BridgeContext, BridgeStatus};
pub use supervisor::{
    CommandSpawner, ReconcileReport, Supervisor, SupervisorEvent, WorkerSpawner, WorkerSpec,
    WorkerState, WorkerStatus,
};

// Transport exports
pub use transport::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatHandle, HeartbeatTask, InboundEvent, IpcClient,
    IpcServer, Params, RpcEnvelope, SessionToken, TransportConfig, TransportError, VoidEvent,
};

// Config exports
pub use config::{
    default_config_path, default_storage_path, load_config, load_config_from_path, save_config,
    BridgeIdentity, BridgeKind, ConfigError, ConfigOverrides, ConfigSource, HubConfig,
};
