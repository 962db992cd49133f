//! Accessory normalization
//!
//! Runs inside each bridge process. Reads the nested accessory graph owned
//! by the embedded library, flattens it into [`NormalizedDevice`] records
//! the hub and remote clients share, and routes writes back into the graph.
//!
//! # Module Overview
//!
//! - [`graph`]: graph nodes, the [`AccessoryHost`] seam, [`MemoryHost`]
//! - [`types`]: type-id tables and the [`DeviceKind`] precedence table
//! - [`flatten`]: graph → device records
//! - [`device`]: device records and their [`Mutable`]/[`SnapshotCapable`] capabilities
//! - [`engine`]: cached list/get plus set/refresh/snapshot

pub mod device;
pub mod engine;
pub mod flatten;
pub mod graph;
pub mod types;

use thiserror::Error;

pub use device::{
    device_uuid, CharacteristicWrite, Mutable, NormalizedCharacteristic, NormalizedDevice,
    SnapshotCapable,
};
pub use engine::{accessories_cache_key, AccessoryEngine, DEFAULT_LIST_TTL};
pub use flatten::{DeviceLayout, FlattenContext, DEFAULT_ROOM};
pub use graph::{
    AccessoryHost, GraphAccessory, GraphCharacteristic, GraphFixture, GraphService, HostError,
    MemoryHost,
};
pub use types::DeviceKind;

/// Accessory operation errors
#[derive(Debug, Error)]
pub enum AccessoryError {
    /// No device with this uuid on the bridge
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device has no such characteristic
    #[error("device {device} has no characteristic {characteristic}")]
    CharacteristicNotFound {
        /// Device uuid
        device: String,
        /// Requested characteristic
        characteristic: String,
    },

    /// Characteristic is read-only
    #[error("characteristic {characteristic} of {device} is not writable")]
    NotWritable {
        /// Device uuid
        device: String,
        /// Characteristic name
        characteristic: String,
    },

    /// Device kind lacks the capability
    #[error("device {device} does not support {operation}")]
    NotSupported {
        /// Device uuid
        device: String,
        /// Attempted operation
        operation: &'static str,
    },

    /// The accessory library failed
    #[error("accessory host error: {0}")]
    Host(String),
}

impl From<HostError> for AccessoryError {
    fn from(e: HostError) -> Self {
        AccessoryError::Host(e.0)
    }
}
