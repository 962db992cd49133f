//! Lookup tables for accessory service and characteristic types.
//!
//! Graph type ids come either in short form (`"3E"`) or as full UUIDs on
//! the HAP base (`"0000003E-0000-1000-8000-0026BB765291"`); [`short_type`]
//! folds both to the short form used as table keys. Custom ids stay full.

use serde::{Deserialize, Serialize};

const HAP_BASE_SUFFIX: &str = "-0000-1000-8000-0026BB765291";

/// Identity service that carries name, manufacturer and serial
pub const ACCESSORY_INFORMATION: &str = "3E";

/// Custom characteristic carrying the owning plugin's id
pub const PLUGIN_ID_TYPE: &str = "0D9F6C91-0001-4B1A-9F5E-B81D6EB0C001";

/// Custom characteristic carrying the plugin's stable device id
pub const DEVICE_ID_TYPE: &str = "0D9F6C91-0002-4B1A-9F5E-B81D6EB0C001";

/// Fold a raw type id to its table key
#[must_use]
pub fn short_type(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    match upper.strip_suffix(HAP_BASE_SUFFIX) {
        Some(prefix) => {
            let trimmed = prefix.trim_start_matches('0');
            if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => upper,
    }
}

const SERVICE_TYPES: &[(&str, &str)] = &[
    ("3E", "accessory_information"),
    ("A2", "protocol_information"),
    ("110", "camera_rtp_stream_management"),
    ("121", "doorbell"),
    ("D8", "television"),
    ("7E", "security_system"),
    ("4A", "thermostat"),
    ("BC", "heater_cooler"),
    ("BB", "air_purifier"),
    ("41", "garage_door_opener"),
    ("45", "lock_mechanism"),
    ("8C", "window_covering"),
    ("81", "door"),
    ("8B", "window"),
    ("D0", "valve"),
    ("40", "fan"),
    ("B7", "fanv2"),
    ("43", "lightbulb"),
    ("47", "outlet"),
    ("49", "switch"),
    ("89", "stateless_programmable_switch"),
    ("80", "contact_sensor"),
    ("85", "motion_sensor"),
    ("86", "occupancy_sensor"),
    ("87", "smoke_sensor"),
    ("7F", "carbon_monoxide_sensor"),
    ("83", "leak_sensor"),
    ("8A", "temperature_sensor"),
    ("82", "humidity_sensor"),
    ("84", "light_sensor"),
    ("8D", "air_quality_sensor"),
    ("96", "battery_service"),
];

const CHARACTERISTIC_TYPES: &[(&str, &str)] = &[
    ("23", "name"),
    ("20", "manufacturer"),
    ("21", "model"),
    ("30", "serial_number"),
    ("52", "firmware_revision"),
    ("14", "identify"),
    ("37", "version"),
    ("25", "on"),
    ("8", "brightness"),
    ("13", "hue"),
    ("2F", "saturation"),
    ("CE", "color_temperature"),
    ("B0", "active"),
    ("26", "outlet_in_use"),
    ("29", "rotation_speed"),
    ("28", "rotation_direction"),
    ("11", "current_temperature"),
    ("35", "target_temperature"),
    ("F", "current_heating_cooling_state"),
    ("33", "target_heating_cooling_state"),
    ("36", "temperature_display_units"),
    ("10", "current_relative_humidity"),
    ("6B", "current_ambient_light_level"),
    ("6A", "contact_sensor_state"),
    ("22", "motion_detected"),
    ("71", "occupancy_detected"),
    ("76", "smoke_detected"),
    ("69", "carbon_monoxide_detected"),
    ("70", "leak_detected"),
    ("95", "air_quality"),
    ("68", "battery_level"),
    ("79", "status_low_battery"),
    ("8F", "charging_state"),
    ("1D", "lock_current_state"),
    ("1E", "lock_target_state"),
    ("E", "current_door_state"),
    ("32", "target_door_state"),
    ("24", "obstruction_detected"),
    ("6D", "current_position"),
    ("7C", "target_position"),
    ("72", "position_state"),
    ("66", "security_system_current_state"),
    ("67", "security_system_target_state"),
    ("73", "programmable_switch_event"),
    (PLUGIN_ID_TYPE, "plugin_id"),
    (DEVICE_ID_TYPE, "device_id"),
];

/// Characteristics that never appear in a flattened device
const BOOKKEEPING: &[&str] = &["name", "identify", "version", "plugin_id", "device_id"];

fn lookup(table: &'static [(&'static str, &'static str)], raw: &str) -> Option<&'static str> {
    let key = short_type(raw);
    table.iter().find(|(id, _)| *id == key).map(|(_, name)| *name)
}

/// Human name of a service type, or `None` if unknown
#[must_use]
pub fn service_name(raw: &str) -> Option<&'static str> {
    lookup(SERVICE_TYPES, raw)
}

/// Human name of a characteristic type, or the raw id if unknown
#[must_use]
pub fn characteristic_name(raw: &str) -> String {
    lookup(CHARACTERISTIC_TYPES, raw).map_or_else(|| raw.to_string(), str::to_string)
}

/// Whether a characteristic is internal bookkeeping
#[must_use]
pub fn is_bookkeeping(name: &str) -> bool {
    BOOKKEEPING.contains(&name)
}

/// Resolved device type
///
/// Declaration order below [`DeviceKind::Bridge`] is the precedence table:
/// an earlier kind is more specific and wins when an accessory exposes
/// several service types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The bridge's own control accessory; assigned, never resolved
    Bridge,
    /// Camera stream
    Camera,
    /// Doorbell
    Doorbell,
    /// Television
    Television,
    /// Security system
    SecuritySystem,
    /// Thermostat
    Thermostat,
    /// Heater/cooler
    HeaterCooler,
    /// Air purifier
    AirPurifier,
    /// Garage door opener
    GarageDoor,
    /// Lock mechanism
    Lock,
    /// Blinds and shades
    WindowCovering,
    /// Motorised door
    Door,
    /// Motorised window
    Window,
    /// Water valve
    Valve,
    /// Fan
    Fan,
    /// Light
    Lightbulb,
    /// Power outlet
    Outlet,
    /// Plain switch
    Switch,
    /// Stateless button
    ProgrammableSwitch,
    /// Contact sensor
    ContactSensor,
    /// Motion sensor
    MotionSensor,
    /// Occupancy sensor
    OccupancySensor,
    /// Smoke sensor
    SmokeSensor,
    /// CO sensor
    CarbonMonoxideSensor,
    /// Leak sensor
    LeakSensor,
    /// Temperature sensor
    TemperatureSensor,
    /// Humidity sensor
    HumiditySensor,
    /// Ambient light sensor
    LightSensor,
    /// Air quality sensor
    AirQualitySensor,
    /// No recognised primary service
    Other,
}

impl DeviceKind {
    /// Precedence table, most specific first
    pub const PRECEDENCE: [DeviceKind; 29] = [
        DeviceKind::Camera,
        DeviceKind::Doorbell,
        DeviceKind::Television,
        DeviceKind::SecuritySystem,
        DeviceKind::Thermostat,
        DeviceKind::HeaterCooler,
        DeviceKind::AirPurifier,
        DeviceKind::GarageDoor,
        DeviceKind::Lock,
        DeviceKind::WindowCovering,
        DeviceKind::Door,
        DeviceKind::Window,
        DeviceKind::Valve,
        DeviceKind::Fan,
        DeviceKind::Lightbulb,
        DeviceKind::Outlet,
        DeviceKind::Switch,
        DeviceKind::ProgrammableSwitch,
        DeviceKind::ContactSensor,
        DeviceKind::MotionSensor,
        DeviceKind::OccupancySensor,
        DeviceKind::SmokeSensor,
        DeviceKind::CarbonMonoxideSensor,
        DeviceKind::LeakSensor,
        DeviceKind::TemperatureSensor,
        DeviceKind::HumiditySensor,
        DeviceKind::LightSensor,
        DeviceKind::AirQualitySensor,
        DeviceKind::Other,
    ];

    /// Position in [`DeviceKind::PRECEDENCE`]; lower is more specific
    #[must_use]
    pub fn rank(self) -> usize {
        Self::PRECEDENCE
            .iter()
            .position(|k| *k == self)
            .unwrap_or(Self::PRECEDENCE.len())
    }

    /// Kind contributed by a service type, if it contributes one
    #[must_use]
    pub fn from_service(raw: &str) -> Option<DeviceKind> {
        let kind = match service_name(raw)? {
            "camera_rtp_stream_management" => DeviceKind::Camera,
            "doorbell" => DeviceKind::Doorbell,
            "television" => DeviceKind::Television,
            "security_system" => DeviceKind::SecuritySystem,
            "thermostat" => DeviceKind::Thermostat,
            "heater_cooler" => DeviceKind::HeaterCooler,
            "air_purifier" => DeviceKind::AirPurifier,
            "garage_door_opener" => DeviceKind::GarageDoor,
            "lock_mechanism" => DeviceKind::Lock,
            "window_covering" => DeviceKind::WindowCovering,
            "door" => DeviceKind::Door,
            "window" => DeviceKind::Window,
            "valve" => DeviceKind::Valve,
            "fan" | "fanv2" => DeviceKind::Fan,
            "lightbulb" => DeviceKind::Lightbulb,
            "outlet" => DeviceKind::Outlet,
            "switch" => DeviceKind::Switch,
            "stateless_programmable_switch" => DeviceKind::ProgrammableSwitch,
            "contact_sensor" => DeviceKind::ContactSensor,
            "motion_sensor" => DeviceKind::MotionSensor,
            "occupancy_sensor" => DeviceKind::OccupancySensor,
            "smoke_sensor" => DeviceKind::SmokeSensor,
            "carbon_monoxide_sensor" => DeviceKind::CarbonMonoxideSensor,
            "leak_sensor" => DeviceKind::LeakSensor,
            "temperature_sensor" => DeviceKind::TemperatureSensor,
            "humidity_sensor" => DeviceKind::HumiditySensor,
            "light_sensor" => DeviceKind::LightSensor,
            "air_quality_sensor" => DeviceKind::AirQualitySensor,
            _ => return None,
        };
        Some(kind)
    }

    /// Characteristic holding a sensor kind's reading
    #[must_use]
    pub fn sensor_reading(self) -> Option<&'static str> {
        match self {
            DeviceKind::ContactSensor => Some("contact_sensor_state"),
            DeviceKind::MotionSensor => Some("motion_detected"),
            DeviceKind::OccupancySensor => Some("occupancy_detected"),
            DeviceKind::SmokeSensor => Some("smoke_detected"),
            DeviceKind::CarbonMonoxideSensor => Some("carbon_monoxide_detected"),
            DeviceKind::LeakSensor => Some("leak_detected"),
            DeviceKind::TemperatureSensor => Some("current_temperature"),
            DeviceKind::HumiditySensor => Some("current_relative_humidity"),
            DeviceKind::LightSensor => Some("current_ambient_light_level"),
            DeviceKind::AirQualitySensor => Some("air_quality"),
            _ => None,
        }
    }

    /// Whether this is a read-only sensor kind
    #[must_use]
    pub fn is_sensor(self) -> bool {
        self.sensor_reading().is_some()
    }

    /// Whether devices of this kind can produce a still image
    #[must_use]
    pub fn supports_snapshot(self) -> bool {
        matches!(self, DeviceKind::Camera | DeviceKind::Doorbell)
    }
}
