use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unit identifier as assigned by the controller
pub type UnitId = String;

/// Binding id used as the first segment of every thing UID
pub const BINDING_ID: &str = "touchwand";

/// Analog sensor kinds reported in an alarm sensor's `sensorsStatus`
pub const SENSOR_TYPE_TEMPERATURE: u32 = 1;
pub const SENSOR_TYPE_LUMINANCE: u32 = 3;

/// Binary sensor kinds reported in an alarm sensor's `bSensorsStatus`
pub const SENSOR_TYPE_LEAK: u32 = 6;
pub const SENSOR_TYPE_DOOR_WINDOW: u32 = 10;
pub const SENSOR_TYPE_MOTION: u32 = 12;

/// Device category of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitType {
    Switch,
    Shutter,
    Dimmer,
    AlarmSensor,
    WallController,
}

impl UnitType {
    /// All unit types this crate understands
    pub const SUPPORTED: [UnitType; 5] = [
        UnitType::Switch,
        UnitType::Shutter,
        UnitType::Dimmer,
        UnitType::AlarmSensor,
        UnitType::WallController,
    ];

    /// Map the controller's type string to a unit type.
    ///
    /// The controller is inconsistent about casing (`Switch` but `shutter`),
    /// so the match is exact against the strings it actually sends.
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|t| t.as_wire() == s)
    }

    /// The type string as the controller sends it
    pub fn as_wire(&self) -> &'static str {
        match self {
            UnitType::Switch => "Switch",
            UnitType::Shutter => "shutter",
            UnitType::Dimmer => "dimmer",
            UnitType::AlarmSensor => "AlarmSensor",
            UnitType::WallController => "WallController",
        }
    }

    /// Thing type id used in discovery results
    pub fn thing_type(&self) -> &'static str {
        match self {
            UnitType::Switch => "switch",
            UnitType::Shutter => "shutter",
            UnitType::Dimmer => "dimmer",
            UnitType::AlarmSensor => "alarmsensor",
            UnitType::WallController => "wallcontroller",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Reported liveness of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Alive,
    Other(String),
}

impl UnitStatus {
    pub fn from_wire(s: &str) -> Self {
        if s == "ALIVE" {
            UnitStatus::Alive
        } else {
            UnitStatus::Other(s.to_string())
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, UnitStatus::Alive)
    }
}

/// Snapshot of one remote device
///
/// A `UnitData` is never mutated: the next event for the same id produces a
/// new value that supersedes this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitData {
    pub id: UnitId,
    pub name: String,
    pub unit_type: UnitType,
    pub status: UnitStatus,

    /// Device specific `currStatus` payload (relay value, shutter position,
    /// sensor readings). `None` when the controller omitted it.
    pub curr_status: Option<serde_json::Value>,
}

impl UnitData {
    /// Numeric current status, as sent by switches, shutters and dimmers
    pub fn numeric_status(&self) -> Option<i64> {
        let status = self.curr_status.as_ref()?;
        status
            .as_i64()
            .or_else(|| status.as_str().and_then(|s| s.trim().parse().ok()))
    }

    /// Typed view of an alarm sensor payload
    pub fn alarm_sensor_status(&self) -> Option<AlarmSensorStatus> {
        if self.unit_type != UnitType::AlarmSensor {
            return None;
        }
        let payload = self.curr_status.as_ref()?;
        match serde_json::from_value(payload.clone()) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(unit_id = %self.id, "Unreadable alarm sensor payload {}: {}", payload, e);
                None
            }
        }
    }
}

/// Alarm sensor `currStatus` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmSensorStatus {
    /// Battery level in percent, clamped to 0..=100
    #[serde(default, deserialize_with = "battery_level")]
    pub batt: Option<u8>,

    #[serde(default, rename = "sensorsStatus")]
    pub sensors: Vec<SensorReading>,

    #[serde(default, rename = "bSensorsStatus")]
    pub binary_sensors: Vec<BinarySensorEvent>,
}

/// Accepts any JSON number; the controller is not consistent about integers
fn battery_level<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let level = Option::<f64>::deserialize(deserializer)?;
    Ok(level.map(|l| l.clamp(0.0, 100.0).round() as u8))
}

/// Analog reading from an alarm sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "type")]
    pub sensor_type: u32,
    pub value: f64,
}

/// Binary reading from an alarm sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarySensorEvent {
    #[serde(rename = "sensorType")]
    pub sensor_type: u32,
    pub sensor: BinarySensorState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarySensorState {
    pub state: bool,
}

/// Candidate device offered to the host for confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// `touchwand:<thing type>:<bridge id>:<unit id>`
    pub thing_uid: String,
    pub thing_type: UnitType,
    pub bridge_uid: String,
    pub label: String,

    /// Always carries `id` and `name`
    pub properties: BTreeMap<String, String>,

    /// Property that identifies the device across rescans
    pub representation_property: String,

    pub timestamp: DateTime<Utc>,
}

impl DiscoveryResult {
    pub(crate) fn new(
        bridge_uid: &str,
        unit_id: &str,
        name: &str,
        unit_type: UnitType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("id".to_string(), unit_id.to_string());
        properties.insert("name".to_string(), name.to_string());

        Self {
            thing_uid: thing_uid(unit_type, bridge_uid, unit_id),
            thing_type: unit_type,
            bridge_uid: bridge_uid.to_string(),
            label: name.to_string(),
            properties,
            representation_property: unit_id.to_string(),
            timestamp,
        }
    }

    /// Unit id this result was built from
    pub fn unit_id(&self) -> &str {
        self.properties.get("id").map(String::as_str).unwrap_or_default()
    }
}

/// Build the UID of a child thing below a bridge
pub fn thing_uid(unit_type: UnitType, bridge_uid: &str, unit_id: &str) -> String {
    let bridge_id = bridge_uid.rsplit(':').next().unwrap_or(bridge_uid);
    format!("{}:{}:{}:{}", BINDING_ID, unit_type.thing_type(), bridge_id, unit_id)
}

/// Host-visible status of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Unknown,
    Online,
    Offline,
    ConfigurationError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_type_wire_strings_are_case_sensitive() {
        assert_eq!(UnitType::from_wire("Switch"), Some(UnitType::Switch));
        assert_eq!(UnitType::from_wire("shutter"), Some(UnitType::Shutter));
        assert_eq!(UnitType::from_wire("switch"), None);
        assert_eq!(UnitType::from_wire("Thermostat"), None);
    }

    #[test]
    fn every_supported_type_round_trips() {
        for unit_type in UnitType::SUPPORTED {
            assert_eq!(UnitType::from_wire(unit_type.as_wire()), Some(unit_type));
        }
    }

    #[test]
    fn battery_level_tolerates_non_integer_values() {
        let status: AlarmSensorStatus = serde_json::from_value(json!({
            "batt": 99.6,
            "sensorsStatus": [{ "type": 1, "value": 20.0 }]
        }))
        .unwrap();
        assert_eq!(status.batt, Some(100));
        assert_eq!(status.sensors.len(), 1);

        let status: AlarmSensorStatus = serde_json::from_value(json!({ "batt": -1 })).unwrap();
        assert_eq!(status.batt, Some(0));

        let status: AlarmSensorStatus = serde_json::from_value(json!({ "batt": null })).unwrap();
        assert_eq!(status.batt, None);
    }

    #[test]
    fn thing_uid_uses_last_bridge_segment() {
        assert_eq!(
            thing_uid(UnitType::Shutter, "touchwand:bridge:home", "12"),
            "touchwand:shutter:home:12"
        );
        assert_eq!(thing_uid(UnitType::Switch, "home", "3"), "touchwand:switch:home:3");
    }

    #[test]
    fn numeric_status_accepts_numbers_and_strings() {
        let mut unit = UnitData {
            id: "1".into(),
            name: "Lamp".into(),
            unit_type: UnitType::Switch,
            status: UnitStatus::Alive,
            curr_status: Some(json!(255)),
        };
        assert_eq!(unit.numeric_status(), Some(255));

        unit.curr_status = Some(json!("0"));
        assert_eq!(unit.numeric_status(), Some(0));

        unit.curr_status = None;
        assert_eq!(unit.numeric_status(), None);
    }

    #[test]
    fn alarm_sensor_status_parses_payload() {
        let unit = UnitData {
            id: "9".into(),
            name: "Hall".into(),
            unit_type: UnitType::AlarmSensor,
            status: UnitStatus::Alive,
            curr_status: Some(json!({
                "batt": 80,
                "sensorsStatus": [{ "type": 1, "value": 21.5 }],
                "bSensorsStatus": [{ "sensorType": 12, "sensor": { "state": true } }]
            })),
        };

        let status = unit.alarm_sensor_status().unwrap();
        assert_eq!(status.batt, Some(80));
        assert_eq!(status.sensors[0].value, 21.5);
        assert!(status.binary_sensors[0].sensor.state);
    }
}
