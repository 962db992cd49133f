//! Normalized device records and their capabilities

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::types::DeviceKind;
use super::AccessoryError;

/// Deterministic device uuid: first 16 bytes of SHA-256(`bridge_id:device_id`)
#[must_use]
pub fn device_uuid(bridge_id: &str, device_id: &str) -> String {
    let digest = Sha256::digest(format!("{bridge_id}:{device_id}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).hyphenated().to_string()
}

/// One flattened characteristic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCharacteristic {
    /// Raw characteristic type id
    pub uuid: String,
    /// Human name, or the raw id if unknown
    #[serde(rename = "type")]
    pub kind: String,
    /// Human name of the owning service
    pub service_type: String,
    /// Current value
    pub value: Value,
    /// Value format
    pub format: String,
    /// Lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Value can be read
    pub readable: bool,
    /// Value can be written
    pub writable: bool,
    /// Reading of the device's primary sensor
    #[serde(default)]
    pub main_sensor: bool,
    /// Graph accessory id
    pub aid: u64,
    /// Graph instance id
    pub iid: u64,
}

/// One accessory flattened for external consumption
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDevice {
    /// Deterministic uuid, see [`device_uuid`]
    pub uuid: String,
    /// Owning bridge
    pub bridge_id: String,
    /// Plugin that provides the accessory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    /// Room; absent on the bridge's own device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Sort position within the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    /// Accessory category code
    pub category: u32,
    /// Name from the identity service
    pub display_name: String,
    /// Manufacturer from the identity service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Serial number from the identity service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Resolved type
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Hidden from user-facing lists
    pub hidden: bool,
    /// Graph accessory id
    pub aid: u64,
    /// Flattened characteristics
    pub characteristics: Vec<NormalizedCharacteristic>,
}

/// A write ready to hand to the accessory host
#[derive(Clone, Debug, PartialEq)]
pub struct CharacteristicWrite {
    /// Graph accessory id
    pub aid: u64,
    /// Graph instance id
    pub iid: u64,
    /// Value in the graph's convention
    pub value: Value,
}

/// Devices that accept characteristic writes
pub trait Mutable {
    /// Validate a write and convert it to graph coordinates
    ///
    /// # Errors
    ///
    /// `CharacteristicNotFound` or `NotWritable`.
    fn prepare_write(
        &self,
        characteristic_type: &str,
        value: Value,
    ) -> Result<CharacteristicWrite, AccessoryError>;
}

/// Devices that can produce a still image
pub trait SnapshotCapable {
    /// Accessory to ask for the image
    fn snapshot_source(&self) -> u64;
}

impl NormalizedDevice {
    /// Characteristic by human name or raw id
    #[must_use]
    pub fn characteristic(&self, characteristic_type: &str) -> Option<&NormalizedCharacteristic> {
        self.characteristics
            .iter()
            .find(|c| c.kind == characteristic_type || c.uuid.eq_ignore_ascii_case(characteristic_type))
    }

    /// Write capability, if any characteristic is writable
    ///
    /// The bridge's own accessory never takes writes.
    #[must_use]
    pub fn as_mutable(&self) -> Option<&dyn Mutable> {
        if self.kind != DeviceKind::Bridge && self.characteristics.iter().any(|c| c.writable) {
            Some(self)
        } else {
            None
        }
    }

    /// Snapshot capability, if this kind of device has one
    #[must_use]
    pub fn as_snapshot(&self) -> Option<&dyn SnapshotCapable> {
        if self.kind.supports_snapshot() {
            Some(self)
        } else {
            None
        }
    }
}

impl Mutable for NormalizedDevice {
    fn prepare_write(
        &self,
        characteristic_type: &str,
        value: Value,
    ) -> Result<CharacteristicWrite, AccessoryError> {
        let target = self.characteristic(characteristic_type).ok_or_else(|| {
            AccessoryError::CharacteristicNotFound {
                device: self.uuid.clone(),
                characteristic: characteristic_type.to_string(),
            }
        })?;
        if !target.writable {
            return Err(AccessoryError::NotWritable {
                device: self.uuid.clone(),
                characteristic: target.kind.clone(),
            });
        }

        // The graph stores booleans as 0/1.
        let value = match value {
            Value::Bool(b) => Value::from(u8::from(b)),
            other => other,
        };

        Ok(CharacteristicWrite {
            aid: target.aid,
            iid: target.iid,
            value,
        })
    }
}

impl SnapshotCapable for NormalizedDevice {
    fn snapshot_source(&self) -> u64 {
        self.aid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn characteristic(kind: &str, writable: bool) -> NormalizedCharacteristic {
        NormalizedCharacteristic {
            uuid: "25".to_string(),
            kind: kind.to_string(),
            service_type: "switch".to_string(),
            value: json!(1),
            format: "bool".to_string(),
            min: None,
            max: None,
            step: None,
            readable: true,
            writable,
            main_sensor: false,
            aid: 2,
            iid: 11,
        }
    }

    fn device(kind: DeviceKind) -> NormalizedDevice {
        NormalizedDevice {
            uuid: device_uuid("den", "lamp"),
            bridge_id: "den".to_string(),
            plugin_id: None,
            room: Some("default".to_string()),
            order: None,
            category: 8,
            display_name: "Lamp".to_string(),
            manufacturer: None,
            serial_number: None,
            kind,
            hidden: false,
            aid: 2,
            characteristics: vec![characteristic("on", true)],
        }
    }

    #[test]
    fn test_device_uuid_shape_and_determinism() {
        let a = device_uuid("den", "lamp");
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
        assert_eq!(a, device_uuid("den", "lamp"));
        assert_ne!(a, device_uuid("attic", "lamp"));
    }

    #[test]
    fn test_prepare_write_coerces_bool() {
        let lamp = device(DeviceKind::Switch);
        let write = lamp.as_mutable().unwrap().prepare_write("on", json!(false)).unwrap();
        assert_eq!(
            write,
            CharacteristicWrite {
                aid: 2,
                iid: 11,
                value: json!(0)
            }
        );

        let write = lamp.as_mutable().unwrap().prepare_write("25", json!(true)).unwrap();
        assert_eq!(write.value, json!(1));
    }

    #[test]
    fn test_prepare_write_errors() {
        let mut lamp = device(DeviceKind::Switch);
        assert!(matches!(
            lamp.prepare_write("brightness", json!(10)),
            Err(AccessoryError::CharacteristicNotFound { .. })
        ));

        lamp.characteristics[0].writable = false;
        assert!(matches!(
            lamp.prepare_write("on", json!(1)),
            Err(AccessoryError::NotWritable { .. })
        ));
    }

    #[test]
    fn test_capabilities_follow_kind() {
        assert!(device(DeviceKind::Bridge).as_mutable().is_none());
        let mut lamp = device(DeviceKind::Switch);
        lamp.characteristics[0].writable = false;
        assert!(lamp.as_mutable().is_none());
        assert!(device(DeviceKind::Switch).as_snapshot().is_none());
        assert_eq!(
            device(DeviceKind::Camera).as_snapshot().map(|s| s.snapshot_source()),
            Some(2)
        );
    }

    #[test]
    fn test_sensor_with_writable_characteristic_accepts_writes() {
        let mut sensor = device(DeviceKind::MotionSensor);
        sensor.characteristics = vec![
            characteristic("motion_detected", false),
            characteristic("E863F10D-079E-48FF-8F27-9C2605A29F52", true),
        ];
        sensor.characteristics[1].iid = 14;

        let write = sensor
            .as_mutable()
            .unwrap()
            .prepare_write("E863F10D-079E-48FF-8F27-9C2605A29F52", json!(30))
            .unwrap();
        assert_eq!((write.aid, write.iid, write.value), (2, 14, json!(30)));
        assert!(matches!(
            sensor.as_mutable().unwrap().prepare_write("motion_detected", json!(true)),
            Err(AccessoryError::NotWritable { .. })
        ));
    }

    #[test]
    fn test_bridge_device_serializes_without_room() {
        let mut bridge = device(DeviceKind::Bridge);
        bridge.room = None;
        let json = serde_json::to_value(&bridge).unwrap();
        assert!(json.get("room").is_none());
        assert_eq!(json["type"], json!("bridge"));
    }
}
