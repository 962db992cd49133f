//! Accessory graph as exposed by the embedded accessory library
//!
//! The library owns a forest of accessories → services → characteristics.
//! This crate only reads it and forwards writes through [`AccessoryHost`].
//! [`MemoryHost`] is an in-process graph loaded from a JSON fixture; the
//! bridge binary and the tests run on it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error raised by the accessory library
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HostError(pub String);

/// One characteristic node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphCharacteristic {
    /// Instance id, unique within the accessory
    pub iid: u64,
    /// Raw type id
    #[serde(rename = "type")]
    pub characteristic_type: String,
    /// Current value
    #[serde(default)]
    pub value: Value,
    /// Value format (`bool`, `uint8`, `float`, `string`, ...)
    #[serde(default)]
    pub format: String,
    /// Lower bound
    #[serde(default, rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound
    #[serde(default, rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step
    #[serde(default, rename = "minStep", skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Permissions: `pr` readable, `pw` writable, `ev` notifies
    #[serde(default)]
    pub perms: Vec<String>,
}

impl GraphCharacteristic {
    /// Whether the value can be read
    #[must_use]
    pub fn readable(&self) -> bool {
        self.perms.iter().any(|p| p == "pr")
    }

    /// Whether the value can be written
    #[must_use]
    pub fn writable(&self) -> bool {
        self.perms.iter().any(|p| p == "pw")
    }
}

/// One service node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphService {
    /// Instance id
    pub iid: u64,
    /// Raw type id
    #[serde(rename = "type")]
    pub service_type: String,
    /// Characteristics in library order
    #[serde(default)]
    pub characteristics: Vec<GraphCharacteristic>,
}

/// One accessory node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphAccessory {
    /// Accessory id within the bridge
    pub aid: u64,
    /// Library-assigned uuid
    pub uuid: String,
    /// Accessory category code
    #[serde(default)]
    pub category: u32,
    /// Services in library order
    #[serde(default)]
    pub services: Vec<GraphService>,
}

impl GraphAccessory {
    /// Characteristic by instance id
    pub fn characteristic_mut(&mut self, iid: u64) -> Option<&mut GraphCharacteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.iid == iid)
    }
}

/// Read/write access to a live accessory graph
#[async_trait]
pub trait AccessoryHost: Send + Sync {
    /// Library uuid of the bridge's own accessory
    fn bridge_accessory_uuid(&self) -> String;

    /// Every accessory, in library order
    async fn accessories(&self) -> Result<Vec<GraphAccessory>, HostError>;

    /// One accessory's current state
    async fn accessory(&self, aid: u64) -> Result<Option<GraphAccessory>, HostError>;

    /// Write a characteristic value
    async fn set_characteristic(&self, aid: u64, iid: u64, value: Value) -> Result<(), HostError>;

    /// Still image from a camera accessory
    async fn snapshot(&self, aid: u64) -> Result<Vec<u8>, HostError>;

    /// Paired controller records
    async fn pairings(&self) -> Result<Value, HostError>;
}

/// On-disk shape of a [`MemoryHost`] graph
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphFixture {
    /// Library uuid of the bridge accessory
    pub bridge_uuid: String,
    /// Accessories, bridge accessory included
    #[serde(default)]
    pub accessories: Vec<GraphAccessory>,
    /// Paired controllers
    #[serde(default)]
    pub pairings: Value,
}

/// In-memory accessory graph
#[derive(Debug)]
pub struct MemoryHost {
    bridge_uuid: String,
    accessories: RwLock<Vec<GraphAccessory>>,
    snapshots: RwLock<HashMap<u64, Vec<u8>>>,
    pairings: Value,
    reads: AtomicUsize,
}

impl MemoryHost {
    /// Graph with the given bridge uuid and accessories
    #[must_use]
    pub fn new(bridge_uuid: impl Into<String>, accessories: Vec<GraphAccessory>) -> Self {
        Self::from(GraphFixture {
            bridge_uuid: bridge_uuid.into(),
            accessories,
            pairings: Value::Array(Vec::new()),
        })
    }

    /// Load a fixture file
    ///
    /// # Errors
    ///
    /// Unreadable or malformed file.
    pub fn from_fixture(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HostError(format!("reading {}: {e}", path.display())))?;
        let fixture: GraphFixture = serde_json::from_str(&text)
            .map_err(|e| HostError(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::from(fixture))
    }

    /// Register a still image for a camera accessory
    pub fn set_snapshot(&self, aid: u64, image: Vec<u8>) {
        self.snapshots.write().insert(aid, image);
    }

    /// Change a value as the library would on a device-side update
    pub fn update_value(&self, aid: u64, iid: u64, value: Value) -> bool {
        let mut accessories = self.accessories.write();
        match accessories
            .iter_mut()
            .find(|a| a.aid == aid)
            .and_then(|a| a.characteristic_mut(iid))
        {
            Some(c) => {
                c.value = value;
                true
            }
            None => false,
        }
    }

    /// Full-graph reads served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl From<GraphFixture> for MemoryHost {
    fn from(fixture: GraphFixture) -> Self {
        Self {
            bridge_uuid: fixture.bridge_uuid,
            accessories: RwLock::new(fixture.accessories),
            snapshots: RwLock::new(HashMap::new()),
            pairings: fixture.pairings,
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AccessoryHost for MemoryHost {
    fn bridge_accessory_uuid(&self) -> String {
        self.bridge_uuid.clone()
    }

    async fn accessories(&self) -> Result<Vec<GraphAccessory>, HostError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.accessories.read().clone())
    }

    async fn accessory(&self, aid: u64) -> Result<Option<GraphAccessory>, HostError> {
        Ok(self.accessories.read().iter().find(|a| a.aid == aid).cloned())
    }

    async fn set_characteristic(&self, aid: u64, iid: u64, value: Value) -> Result<(), HostError> {
        let mut accessories = self.accessories.write();
        let accessory = accessories
            .iter_mut()
            .find(|a| a.aid == aid)
            .ok_or_else(|| HostError(format!("no accessory {aid}")))?;
        let characteristic = accessory
            .characteristic_mut(iid)
            .ok_or_else(|| HostError(format!("no characteristic {aid}.{iid}")))?;
        if !characteristic.writable() {
            return Err(HostError(format!("characteristic {aid}.{iid} is read-only")));
        }
        characteristic.value = value;
        Ok(())
    }

    async fn snapshot(&self, aid: u64) -> Result<Vec<u8>, HostError> {
        self.snapshots
            .read()
            .get(&aid)
            .cloned()
            .ok_or_else(|| HostError(format!("no snapshot source for accessory {aid}")))
    }

    async fn pairings(&self) -> Result<Value, HostError> {
        Ok(self.pairings.clone())
    }
}
