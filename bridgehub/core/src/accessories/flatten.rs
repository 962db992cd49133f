//! Accessory graph flattening
//!
//! Each accessory becomes one [`NormalizedDevice`]:
//!
//! 1. Identity-service values (name, manufacturer, serial, plugin id,
//!    device id) are hoisted onto the device.
//! 2. Every other service's characteristics are merged into one list,
//!    dropping name echoes and bookkeeping characteristics.
//! 3. The device kind is the lowest-ranked kind among the services, so the
//!    result does not depend on service order.
//! 4. The reading of the best-ranked sensor service is tagged `main_sensor`.
//! 5. The bridge's own accessory becomes a hidden `bridge` device with no
//!    room or order; every other device gets its stored layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::device::{device_uuid, NormalizedCharacteristic, NormalizedDevice};
use super::graph::{GraphAccessory, GraphService};
use super::types::{self, DeviceKind};

/// Room used when a device has no stored layout
pub const DEFAULT_ROOM: &str = "default";

/// User-assigned placement of one device
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLayout {
    /// Room name
    #[serde(default)]
    pub room: Option<String>,
    /// Sort position
    #[serde(default)]
    pub order: Option<u32>,
    /// Hidden from user-facing lists
    #[serde(default)]
    pub hidden: Option<bool>,
}

/// Inputs shared by every accessory of one bridge
#[derive(Debug)]
pub struct FlattenContext<'a> {
    /// Owning bridge id
    pub bridge_id: &'a str,
    /// Library uuid of the bridge's own accessory
    pub bridge_accessory_uuid: &'a str,
    /// Layout by device uuid
    pub layout: &'a HashMap<String, DeviceLayout>,
}

#[derive(Default)]
struct Identity {
    name: Option<String>,
    manufacturer: Option<String>,
    serial_number: Option<String>,
    plugin_id: Option<String>,
    device_id: Option<String>,
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_identity(service: &GraphService) -> bool {
    types::short_type(&service.service_type) == types::ACCESSORY_INFORMATION
}

fn hoist_identity(accessory: &GraphAccessory) -> Identity {
    let mut identity = Identity::default();
    for service in accessory.services.iter().filter(|s| is_identity(s)) {
        for c in &service.characteristics {
            let slot = match types::characteristic_name(&c.characteristic_type).as_str() {
                "name" => &mut identity.name,
                "manufacturer" => &mut identity.manufacturer,
                "serial_number" => &mut identity.serial_number,
                "plugin_id" => &mut identity.plugin_id,
                "device_id" => &mut identity.device_id,
                _ => continue,
            };
            if slot.is_none() {
                *slot = as_text(&c.value);
            }
        }
    }
    identity
}

/// Service carrying the main sensor reading: lowest sensor rank, then iid
fn main_sensor_service(accessory: &GraphAccessory) -> Option<(u64, &'static str)> {
    accessory
        .services
        .iter()
        .filter_map(|s| {
            let kind = DeviceKind::from_service(&s.service_type)?;
            kind.sensor_reading().map(|reading| (kind.rank(), s.iid, reading))
        })
        .min_by_key(|(rank, iid, _)| (*rank, *iid))
        .map(|(_, iid, reading)| (iid, reading))
}

/// Flatten one accessory
#[must_use]
pub fn flatten_accessory(ctx: &FlattenContext<'_>, accessory: &GraphAccessory) -> NormalizedDevice {
    let identity = hoist_identity(accessory);
    let device_id = identity
        .device_id
        .clone()
        .unwrap_or_else(|| accessory.uuid.clone());
    let uuid = device_uuid(ctx.bridge_id, &device_id);

    let kind = accessory
        .services
        .iter()
        .filter_map(|s| DeviceKind::from_service(&s.service_type))
        .min_by_key(|k| k.rank())
        .unwrap_or(DeviceKind::Other);

    let main_sensor = main_sensor_service(accessory);

    let characteristics = accessory
        .services
        .iter()
        .filter(|s| !is_identity(s))
        .flat_map(|service| {
            let service_type = types::service_name(&service.service_type)
                .map_or_else(|| service.service_type.clone(), str::to_string);
            service.characteristics.iter().filter_map(move |c| {
                let name = types::characteristic_name(&c.characteristic_type);
                if types::is_bookkeeping(&name) {
                    return None;
                }
                let is_main = main_sensor
                    .is_some_and(|(iid, reading)| iid == service.iid && reading == name);
                Some(NormalizedCharacteristic {
                    uuid: c.characteristic_type.clone(),
                    kind: name,
                    service_type: service_type.clone(),
                    value: c.value.clone(),
                    format: c.format.clone(),
                    min: c.min,
                    max: c.max,
                    step: c.step,
                    readable: c.readable(),
                    writable: c.writable(),
                    main_sensor: is_main,
                    aid: accessory.aid,
                    iid: c.iid,
                })
            })
        })
        .collect();

    let mut device = NormalizedDevice {
        display_name: identity.name.unwrap_or_else(|| accessory.uuid.clone()),
        uuid,
        bridge_id: ctx.bridge_id.to_string(),
        plugin_id: identity.plugin_id,
        room: None,
        order: None,
        category: accessory.category,
        manufacturer: identity.manufacturer,
        serial_number: identity.serial_number,
        kind,
        hidden: false,
        aid: accessory.aid,
        characteristics,
    };

    if accessory.uuid == ctx.bridge_accessory_uuid {
        device.kind = DeviceKind::Bridge;
        device.hidden = true;
    } else {
        let layout = ctx.layout.get(&device.uuid);
        device.room = Some(
            layout
                .and_then(|l| l.room.clone())
                .unwrap_or_else(|| DEFAULT_ROOM.to_string()),
        );
        device.order = layout.and_then(|l| l.order);
        device.hidden = layout.and_then(|l| l.hidden).unwrap_or(false);
    }
    device
}

/// Flatten every accessory, preserving graph order
#[must_use]
pub fn flatten(ctx: &FlattenContext<'_>, accessories: &[GraphAccessory]) -> Vec<NormalizedDevice> {
    accessories
        .iter()
        .map(|a| flatten_accessory(ctx, a))
        .collect()
}
