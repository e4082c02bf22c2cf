use crate::error::{GatewayError, Result};
use crate::types::{UnitData, UnitStatus, UnitType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// REST endpoints, relative to `http://{host}:{port}`
pub const PATH_LOGIN: &str = "/auth/login";
pub const PATH_LIST_UNITS: &str = "/units/listUnits";
pub const PATH_UNIT_ACTION: &str = "/units/action";
pub const PATH_GET_UNIT_BY_ID: &str = "/units/getUnitByID";

/// Body the controller returns when login is rejected
pub const UNAUTHORIZED_MARKER: &str = "Unauthorized";

/// WebSocket endpoint path and subprotocol
pub const WS_PATH: &str = "/async";
pub const WS_SUBPROTOCOL: &str = "relay_protocol";

/// First frame sent after the socket opens
pub const WS_HANDSHAKE: &str = r#"{"myopenhab":"myopenhab"}"#;

/// The only event type acted upon
pub const EVENT_UNIT_CHANGED: &str = "UNIT_CHANGED";

/// Relay values used by switch actions
pub const SWITCH_STATUS_ON: u8 = 255;
pub const SWITCH_STATUS_OFF: u8 = 0;

/// Asynchronous event frame pushed by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Value>,
}

/// One unit as the controller describes it, in events and in `listUnits`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitEntry {
    /// Numeric or string id, normalized by [`UnitEntry::id_string`]
    pub id: Value,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub unit_type: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub connectivity: Option<String>,
    #[serde(default, rename = "idData")]
    pub id_data: Option<Value>,
    #[serde(default, rename = "currStatus")]
    pub curr_status: Option<Value>,
}

impl UnitEntry {
    /// The unit id as a string, whether the controller sent a number or a string
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether the unit belongs to a secondary controller.
    ///
    /// Units of the primary controller carry a null or empty `idData`.
    pub fn is_secondary(&self) -> bool {
        match &self.id_data {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Build a [`UnitData`] from this entry
    pub fn into_unit_data(self) -> Result<UnitData> {
        let id = self
            .id_string()
            .ok_or_else(|| GatewayError::InvalidResponse(format!("Invalid unit id {}", self.id)))?;
        let unit_type = UnitType::from_wire(&self.unit_type)
            .ok_or_else(|| GatewayError::UnsupportedUnitType(self.unit_type.clone()))?;
        let status = UnitStatus::from_wire(self.status.as_deref().unwrap_or_default());

        Ok(UnitData {
            id,
            name: self.name,
            unit_type,
            status,
            curr_status: self.curr_status,
        })
    }
}

/// Parse a WebSocket frame into a unit update.
///
/// Returns `Ok(None)` for frames that carry nothing to act on: other event
/// types, units that are not alive, and unsupported unit types. Malformed
/// frames are an error.
pub fn parse_event(text: &str) -> Result<Option<UnitData>> {
    let event: Event = serde_json::from_str(text)?;
    if event.event_type != EVENT_UNIT_CHANGED {
        return Ok(None);
    }

    let unit = event
        .unit
        .ok_or_else(|| GatewayError::InvalidResponse("UNIT_CHANGED without unit".to_string()))?;
    let entry: UnitEntry = serde_json::from_value(unit)?;

    if entry.status.as_deref() != Some("ALIVE") {
        return Ok(None);
    }

    match entry.into_unit_data() {
        Ok(unit) => Ok(Some(unit)),
        Err(GatewayError::UnsupportedUnitType(t)) => {
            tracing::debug!("UNIT_CHANGED for unsupported unit type {}", t);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Parse the `getUnitByID` response body into a unit
pub fn parse_unit(text: &str) -> Result<UnitData> {
    serde_json::from_str::<UnitEntry>(text)?.into_unit_data()
}

/// Parse the `listUnits` response body
pub fn parse_unit_list(text: &str) -> Result<Vec<UnitEntry>> {
    let value: Value = serde_json::from_str(text)?;
    let items = value
        .as_array()
        .ok_or_else(|| GatewayError::InvalidResponse("listUnits response is not an array".to_string()))?;

    let mut units = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<UnitEntry>(item.clone()) {
            Ok(entry) => units.push(entry),
            Err(e) => tracing::warn!("Skipping malformed unit entry {}: {}", item, e),
        }
    }
    Ok(units)
}

/// Device command, rendered to the `/units/action` JSON body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCommand {
    SwitchOn,
    SwitchOff,
    ShutterUp,
    ShutterDown,
    ShutterStop,
    /// Absolute shutter position
    ShutterPosition(u8),
    /// Dimmer level
    DimmerLevel(u8),
}

impl UnitCommand {
    /// Render the action payload for the given unit id
    pub fn payload(&self, unit_id: &str) -> Value {
        let id = action_id(unit_id);
        match *self {
            UnitCommand::SwitchOn => json!({ "id": id, "value": SWITCH_STATUS_ON }),
            UnitCommand::SwitchOff => json!({ "id": id, "value": SWITCH_STATUS_OFF }),
            UnitCommand::ShutterUp => json!({ "id": id, "value": 255, "type": "height" }),
            UnitCommand::ShutterDown => json!({ "id": id, "value": 0, "type": "height" }),
            UnitCommand::ShutterStop => json!({ "id": id, "value": 0, "type": "stop" }),
            UnitCommand::ShutterPosition(position) => json!({ "id": id, "value": position }),
            UnitCommand::DimmerLevel(level) => json!({ "id": id, "value": level }),
        }
    }
}

// The controller expects numeric ids unquoted.
fn action_id(unit_id: &str) -> Value {
    match unit_id.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(unit_id),
    }
}
