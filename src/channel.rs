//! Mapping of unit payloads onto channel states.
//!
//! Each unit type exposes a fixed set of channels. The functions here turn a
//! [`UnitData`] into the channel updates a host should apply; they hold no
//! state except for the alarm sensor's battery hysteresis.

use crate::types::{
    UnitData, UnitType, SENSOR_TYPE_DOOR_WINDOW, SENSOR_TYPE_LEAK, SENSOR_TYPE_LUMINANCE, SENSOR_TYPE_MOTION,
    SENSOR_TYPE_TEMPERATURE,
};

pub const CHANNEL_SWITCH: &str = "switch";
pub const CHANNEL_SHUTTER: &str = "shutter";
pub const CHANNEL_BRIGHTNESS: &str = "brightness";
pub const CHANNEL_BATTERY_LEVEL: &str = "battery_level";
pub const CHANNEL_BATTERY_LOW: &str = "battery_low";
pub const CHANNEL_ILLUMINATION: &str = "illumination";
pub const CHANNEL_TEMPERATURE: &str = "temperature";
pub const CHANNEL_LEAK: &str = "leak";
pub const CHANNEL_MOTION: &str = "motion";
pub const CHANNEL_DOOR_WINDOW: &str = "door_window";

/// Battery level at or below which the low-battery channel turns on
pub const BATTERY_LEVEL_LOW: u8 = 20;

/// Extra margin the level must clear before low-battery turns off again
pub const BATTERY_LEVEL_LOW_HYSTERESIS: u8 = 5;

const RAW_MAX: i64 = 255;

/// State value for one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    OnOff(bool),
    OpenClosed(bool),
    Percent(u8),
    Decimal(f64),
    /// Temperature in degrees Celsius
    Celsius(f64),
    /// Illuminance in lux
    Lux(f64),
}

/// One channel update produced from a unit payload
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub channel: &'static str,
    pub state: ChannelState,
}

impl ChannelUpdate {
    fn new(channel: &'static str, state: ChannelState) -> Self {
        Self { channel, state }
    }
}

/// Scale a raw 0..=255 controller value to percent
pub fn raw_to_percent(raw: i64) -> u8 {
    let raw = raw.clamp(0, RAW_MAX);
    ((raw * 100 + RAW_MAX / 2) / RAW_MAX) as u8
}

/// Scale a percent value to the controller's 0..=255 range
pub fn percent_to_raw(percent: u8) -> u8 {
    let percent = i64::from(percent.min(100));
    ((percent * RAW_MAX + 50) / 100) as u8
}

/// Channel updates for switches, shutters and dimmers.
///
/// Alarm sensors need per-unit state; use [`AlarmSensorState`] for them.
pub fn channel_updates(unit: &UnitData) -> Vec<ChannelUpdate> {
    let Some(raw) = unit.numeric_status() else {
        return Vec::new();
    };

    match unit.unit_type {
        UnitType::Switch => vec![ChannelUpdate::new(CHANNEL_SWITCH, ChannelState::OnOff(raw != 0))],
        UnitType::Shutter => vec![ChannelUpdate::new(
            CHANNEL_SHUTTER,
            ChannelState::Percent(raw_to_percent(raw)),
        )],
        UnitType::Dimmer => vec![ChannelUpdate::new(
            CHANNEL_BRIGHTNESS,
            ChannelState::Percent(raw_to_percent(raw)),
        )],
        UnitType::AlarmSensor | UnitType::WallController => Vec::new(),
    }
}

/// Per-unit state for an alarm sensor
#[derive(Debug, Default)]
pub struct AlarmSensorState {
    battery_low: bool,
}

impl AlarmSensorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_battery_low(&self) -> bool {
        self.battery_low
    }

    /// Channel updates for one alarm sensor payload
    pub fn update(&mut self, unit: &UnitData) -> Vec<ChannelUpdate> {
        let Some(status) = unit.alarm_sensor_status() else {
            tracing::warn!(unit_id = %unit.id, "Alarm sensor update without a sensor payload");
            return Vec::new();
        };

        let mut updates = Vec::new();

        if let Some(batt) = status.batt {
            updates.push(ChannelUpdate::new(CHANNEL_BATTERY_LEVEL, ChannelState::Decimal(f64::from(batt))));
            let threshold = if self.battery_low {
                BATTERY_LEVEL_LOW + BATTERY_LEVEL_LOW_HYSTERESIS
            } else {
                BATTERY_LEVEL_LOW
            };
            self.battery_low = batt <= threshold;
            updates.push(ChannelUpdate::new(CHANNEL_BATTERY_LOW, ChannelState::OnOff(self.battery_low)));
        }

        for sensor in &status.sensors {
            match sensor.sensor_type {
                SENSOR_TYPE_LUMINANCE => {
                    updates.push(ChannelUpdate::new(CHANNEL_ILLUMINATION, ChannelState::Lux(sensor.value)))
                }
                SENSOR_TYPE_TEMPERATURE => {
                    updates.push(ChannelUpdate::new(CHANNEL_TEMPERATURE, ChannelState::Celsius(sensor.value)))
                }
                _ => {}
            }
        }

        for event in &status.binary_sensors {
            let state = event.sensor.state;
            match event.sensor_type {
                SENSOR_TYPE_LEAK => updates.push(ChannelUpdate::new(CHANNEL_LEAK, ChannelState::OnOff(state))),
                SENSOR_TYPE_MOTION => updates.push(ChannelUpdate::new(CHANNEL_MOTION, ChannelState::OnOff(state))),
                SENSOR_TYPE_DOOR_WINDOW => {
                    updates.push(ChannelUpdate::new(CHANNEL_DOOR_WINDOW, ChannelState::OpenClosed(state)))
                }
                _ => {}
            }
        }

        updates
    }
}
