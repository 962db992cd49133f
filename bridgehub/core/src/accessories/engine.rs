//! Accessory engine
//!
//! Serves the flattened device list of one bridge from the cache and routes
//! mutations into the live graph. The cached list is read-through-stale:
//! callers that need current values use `refresh` or `list(true)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::device::{NormalizedCharacteristic, NormalizedDevice};
use super::flatten::{flatten, flatten_accessory, DeviceLayout, FlattenContext};
use super::graph::AccessoryHost;
use super::AccessoryError;
use crate::cache::Cache;

/// Default lifetime of a flattened list
pub const DEFAULT_LIST_TTL: Duration = Duration::from_secs(30);

/// Cache key holding a bridge's flattened list
#[must_use]
pub fn accessories_cache_key(bridge_id: &str) -> String {
    format!("accessories:{bridge_id}")
}

/// Normalization engine for one bridge
pub struct AccessoryEngine {
    bridge_id: String,
    bridge_accessory_uuid: String,
    host: Arc<dyn AccessoryHost>,
    cache: Arc<Cache>,
    ttl: Duration,
    layout: RwLock<HashMap<String, DeviceLayout>>,
}

impl AccessoryEngine {
    /// Engine for `bridge_id` over `host`, caching in `cache`
    pub fn new(bridge_id: impl Into<String>, host: Arc<dyn AccessoryHost>, cache: Arc<Cache>) -> Self {
        let bridge_id = bridge_id.into();
        let bridge_accessory_uuid = host.bridge_accessory_uuid();
        Self {
            bridge_id,
            bridge_accessory_uuid,
            host,
            cache,
            ttl: DEFAULT_LIST_TTL,
            layout: RwLock::new(HashMap::new()),
        }
    }

    /// Override the list TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bridge this engine serves
    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// Library uuid of the bridge's own accessory
    pub fn bridge_accessory_uuid(&self) -> &str {
        &self.bridge_accessory_uuid
    }

    /// Cache key of the flattened list
    pub fn cache_key(&self) -> String {
        accessories_cache_key(&self.bridge_id)
    }

    /// The accessory host
    pub fn host(&self) -> &Arc<dyn AccessoryHost> {
        &self.host
    }

    /// Every device, from cache unless `force` or the entry expired
    ///
    /// # Errors
    ///
    /// `Host` if the graph cannot be read.
    pub async fn list(&self, force: bool) -> Result<Vec<NormalizedDevice>, AccessoryError> {
        let key = self.cache_key();
        if !force {
            if let Some(devices) = self.cache.get::<Vec<NormalizedDevice>>(&key) {
                return Ok(devices);
            }
        }

        let graph = self.host.accessories().await?;
        let devices = {
            let layout = self.layout.read();
            flatten(&self.context(&layout), &graph)
        };

        if let Err(e) = self.cache.set(&key, &devices, self.ttl) {
            warn!(bridge_id = %self.bridge_id, error = %e, "Failed to cache accessory list");
        }
        debug!(bridge_id = %self.bridge_id, devices = devices.len(), force, "Rebuilt accessory list");
        Ok(devices)
    }

    /// One device by uuid
    ///
    /// # Errors
    ///
    /// `Host` if the graph cannot be read.
    pub async fn get(&self, uuid: &str, force: bool) -> Result<Option<NormalizedDevice>, AccessoryError> {
        Ok(self.list(force).await?.into_iter().find(|d| d.uuid == uuid))
    }

    async fn require(&self, uuid: &str) -> Result<NormalizedDevice, AccessoryError> {
        self.get(uuid, false)
            .await?
            .ok_or_else(|| AccessoryError::DeviceNotFound(uuid.to_string()))
    }

    /// Write a characteristic and return the re-read device
    ///
    /// Booleans are written as 0/1. Only this device's slot in the cached
    /// list is rewritten; the entry keeps its expiry.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound`, `NotSupported` when nothing on the device is writable,
    /// `CharacteristicNotFound`, `NotWritable`, or `Host` if the setter fails.
    pub async fn set(
        &self,
        uuid: &str,
        characteristic_type: &str,
        value: Value,
    ) -> Result<NormalizedDevice, AccessoryError> {
        let device = self.require(uuid).await?;
        let write = device
            .as_mutable()
            .ok_or_else(|| AccessoryError::NotSupported {
                device: uuid.to_string(),
                operation: "set",
            })?
            .prepare_write(characteristic_type, value)?;

        self.host
            .set_characteristic(write.aid, write.iid, write.value.clone())
            .await?;
        info!(
            bridge_id = %self.bridge_id,
            device = %device.display_name,
            characteristic = characteristic_type,
            value = %write.value,
            "Characteristic set"
        );

        self.reread(&device).await
    }

    /// Re-read one device from the graph and rewrite its cached slot
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` or `Host`.
    pub async fn refresh(&self, uuid: &str) -> Result<NormalizedDevice, AccessoryError> {
        let device = self.require(uuid).await?;
        self.reread(&device).await
    }

    async fn reread(&self, device: &NormalizedDevice) -> Result<NormalizedDevice, AccessoryError> {
        let accessory = self
            .host
            .accessory(device.aid)
            .await?
            .ok_or_else(|| AccessoryError::DeviceNotFound(device.uuid.clone()))?;

        let refreshed = {
            let layout = self.layout.read();
            flatten_accessory(&self.context(&layout), &accessory)
        };

        let slot = refreshed.clone();
        let updated = self
            .cache
            .update::<Vec<NormalizedDevice>, _>(&self.cache_key(), move |devices| {
                if let Some(existing) = devices.iter_mut().find(|d| d.uuid == slot.uuid) {
                    *existing = slot;
                }
            });
        if let Err(e) = updated {
            warn!(bridge_id = %self.bridge_id, error = %e, "Dropping unreadable accessory cache");
            self.invalidate();
        }
        Ok(refreshed)
    }

    /// Still image from a camera device
    ///
    /// # Errors
    ///
    /// `DeviceNotFound`, `NotSupported` for kinds without snapshots, or `Host`.
    pub async fn snapshot(&self, uuid: &str) -> Result<Vec<u8>, AccessoryError> {
        let device = self.require(uuid).await?;
        let source = device
            .as_snapshot()
            .ok_or_else(|| AccessoryError::NotSupported {
                device: uuid.to_string(),
                operation: "snapshot",
            })?
            .snapshot_source();
        Ok(self.host.snapshot(source).await?)
    }

    /// A device's flattened characteristics
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` or `Host`.
    pub async fn characteristics(&self, uuid: &str) -> Result<Vec<NormalizedCharacteristic>, AccessoryError> {
        Ok(self.require(uuid).await?.characteristics)
    }

    /// Paired controllers known to the host
    ///
    /// # Errors
    ///
    /// `Host`.
    pub async fn pairings(&self) -> Result<Value, AccessoryError> {
        Ok(self.host.pairings().await?)
    }

    /// Store a device's room/order/hidden placement and drop the cached list
    pub fn set_layout(&self, uuid: impl Into<String>, layout: DeviceLayout) {
        self.layout.write().insert(uuid.into(), layout);
        self.invalidate();
    }

    /// Drop the cached list so the next read rebuilds it
    pub fn invalidate(&self) {
        self.cache.remove(&self.cache_key());
    }

    fn context<'a>(&'a self, layout: &'a HashMap<String, DeviceLayout>) -> FlattenContext<'a> {
        FlattenContext {
            bridge_id: &self.bridge_id,
            bridge_accessory_uuid: &self.bridge_accessory_uuid,
            layout,
        }
    }
}
