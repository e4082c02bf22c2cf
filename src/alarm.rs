//! Camera alarm notifications.
//!
//! Dahua-style cameras push alarm events and configuration dumps as plain
//! text, one `key=value` record per line. Event lines look like
//! `Code=VideoMotion;action=Start;index=0`, configuration lines like
//! `table.MotionDetect[0].Enable=true`. The text is tokenized into records
//! first and only then mapped to channel updates. A channel that no record
//! mentions is left as it was.

use crate::channel::{ChannelState, ChannelUpdate};
use std::collections::HashMap;

pub const CHANNEL_MOTION_ALARM: &str = "motionAlarm";
pub const CHANNEL_ITEM_TAKEN: &str = "itemTaken";
pub const CHANNEL_ITEM_LEFT: &str = "itemLeft";
pub const CHANNEL_LINE_CROSSING_ALARM: &str = "lineCrossingAlarm";
pub const CHANNEL_AUDIO_ALARM: &str = "audioAlarm";
pub const CHANNEL_FACE_DETECTED: &str = "faceDetected";
pub const CHANNEL_PARKING_ALARM: &str = "parkingAlarm";
pub const CHANNEL_FIELD_DETECTION_ALARM: &str = "fieldDetectionAlarm";
pub const CHANNEL_EXTERNAL_ALARM_INPUT: &str = "externalAlarmInput";
pub const CHANNEL_EXTERNAL_ALARM_INPUT2: &str = "externalAlarmInput2";
pub const CHANNEL_ENABLE_MOTION_ALARM: &str = "enableMotionAlarm";
pub const CHANNEL_ENABLE_AUDIO_ALARM: &str = "enableAudioAlarm";
pub const CHANNEL_THRESHOLD_AUDIO_ALARM: &str = "thresholdAudioAlarm";
pub const CHANNEL_ENABLE_LINE_CROSSING_ALARM: &str = "enableLineCrossingAlarm";
pub const CHANNEL_ACTIVATE_ALARM_OUTPUT: &str = "activateAlarmOutput";
pub const CHANNEL_ACTIVATE_ALARM_OUTPUT2: &str = "activateAlarmOutput2";
pub const CHANNEL_ENABLE_LED: &str = "enableLED";
pub const CHANNEL_AUTO_LED: &str = "autoLED";
pub const CHANNEL_TEXT_OVERLAY: &str = "textOverlay";

const CONFIG_PREFIX: &str = "table.";
const CONFIG_MANAGER: &str = "/cgi-bin/configManager.cgi";

/// Phase of an alarm event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    Start,
    Stop,
}

/// One tokenized line of camera output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmRecord {
    /// `Code=<code>;action=<Start|Stop>;index=<n>`
    Event {
        code: String,
        action: AlarmAction,
        index: u32,
    },
    /// `table.<key>=<value>`, with the `table.` prefix removed
    Config { key: String, value: String },
}

/// Split camera output into records; lines that are neither shape are skipped
pub fn tokenize(content: &str) -> Vec<AlarmRecord> {
    content.lines().filter_map(|line| parse_line(line.trim())).collect()
}

fn parse_line(line: &str) -> Option<AlarmRecord> {
    if let Some(config) = line.strip_prefix(CONFIG_PREFIX) {
        let (key, value) = config.split_once('=')?;
        return Some(AlarmRecord::Config {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    let fields: HashMap<&str, &str> = line
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let code = fields.get("Code")?;
    let action = match *fields.get("action")? {
        "Start" => AlarmAction::Start,
        "Stop" => AlarmAction::Stop,
        _ => return None,
    };
    let index = fields.get("index")?.parse().ok()?;

    Some(AlarmRecord::Event {
        code: code.to_string(),
        action,
        index,
    })
}

/// Maps camera notifications to channel updates
#[derive(Debug, Clone, Default)]
pub struct AlarmParser {
    nvr_channel: u32,
}

impl AlarmParser {
    /// Parser for a camera behind NVR channel `nvr_channel` (0 for a plain camera)
    pub fn new(nvr_channel: u32) -> Self {
        Self { nvr_channel }
    }

    /// Channel updates for one chunk of camera output
    pub fn updates(&self, content: &str) -> Vec<ChannelUpdate> {
        if !content.is_empty() {
            tracing::trace!("HTTP result back from camera: {}", content);
        }
        tokenize(content)
            .iter()
            .filter_map(|record| self.map_record(record))
            .collect()
    }

    fn map_record(&self, record: &AlarmRecord) -> Option<ChannelUpdate> {
        match record {
            AlarmRecord::Event { code, action, index } => {
                let channel = event_channel(code, *index)?;
                Some(ChannelUpdate {
                    channel,
                    state: ChannelState::OnOff(*action == AlarmAction::Start),
                })
            }
            AlarmRecord::Config { key, value } => self.config_update(key, value),
        }
    }

    fn config_update(&self, key: &str, value: &str) -> Option<ChannelUpdate> {
        let motion_keys = [
            "MotionDetect[0].Enable".to_string(),
            format!("MotionDetect[{}].Enable", self.nvr_channel),
        ];

        let (channel, state) = if motion_keys.iter().any(|k| k == key) {
            (CHANNEL_ENABLE_MOTION_ALARM, ChannelState::OnOff(parse_bool(value)?))
        } else if key == "AudioDetect[0].MutationDetect" {
            (CHANNEL_ENABLE_AUDIO_ALARM, ChannelState::OnOff(parse_bool(value)?))
        } else if key == "AudioDetect[0].MutationThreold" {
            let threshold: u32 = value.parse().ok()?;
            (CHANNEL_THRESHOLD_AUDIO_ALARM, ChannelState::Percent(threshold.min(100) as u8))
        } else if key == "VideoAnalyseRule[0][1].Enable" {
            (CHANNEL_ENABLE_LINE_CROSSING_ALARM, ChannelState::OnOff(parse_bool(value)?))
        } else {
            return None;
        };

        Some(ChannelUpdate { channel, state })
    }
}

fn event_channel(code: &str, index: u32) -> Option<&'static str> {
    match (code, index) {
        ("VideoMotion", 0) => Some(CHANNEL_MOTION_ALARM),
        ("TakenAwayDetection", 0) => Some(CHANNEL_ITEM_TAKEN),
        ("LeftDetection", 0) => Some(CHANNEL_ITEM_LEFT),
        ("CrossLineDetection", 0) => Some(CHANNEL_LINE_CROSSING_ALARM),
        ("AudioMutation", 0) => Some(CHANNEL_AUDIO_ALARM),
        ("FaceDetection", 0) => Some(CHANNEL_FACE_DETECTED),
        ("ParkingDetection", 0) => Some(CHANNEL_PARKING_ALARM),
        ("CrossRegionDetection", 0) => Some(CHANNEL_FIELD_DETECTION_ALARM),
        ("AlarmLocal", 0) => Some(CHANNEL_EXTERNAL_ALARM_INPUT),
        ("AlarmLocal", 1) => Some(CHANNEL_EXTERNAL_ALARM_INPUT2),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Request path that refreshes the given channel, if it can be refreshed
pub fn refresh_path(channel: &str) -> Option<&'static str> {
    match channel {
        CHANNEL_ENABLE_AUDIO_ALARM => Some("/cgi-bin/configManager.cgi?action=getConfig&name=AudioDetect[0]"),
        CHANNEL_ENABLE_LINE_CROSSING_ALARM => {
            Some("/cgi-bin/configManager.cgi?action=getConfig&name=VideoAnalyseRule")
        }
        CHANNEL_ENABLE_MOTION_ALARM => Some("/cgi-bin/configManager.cgi?action=getConfig&name=MotionDetect[0]"),
        _ => None,
    }
}

/// Request path that switches the given channel on or off
pub fn switch_path(channel: &str, on: bool) -> Option<String> {
    let settings = match (channel, on) {
        (CHANNEL_ENABLE_MOTION_ALARM, true) => "MotionDetect[0].Enable=true&MotionDetect[0].EventHandler.Dejitter=1",
        (CHANNEL_ENABLE_MOTION_ALARM, false) => "MotionDetect[0].Enable=false",
        (CHANNEL_ENABLE_AUDIO_ALARM, true) => {
            "AudioDetect[0].MutationDetect=true&AudioDetect[0].EventHandler.Dejitter=1"
        }
        (CHANNEL_ENABLE_AUDIO_ALARM, false) => "AudioDetect[0].MutationDetect=false",
        (CHANNEL_ENABLE_LINE_CROSSING_ALARM, on) => {
            return Some(set_config(&format!("VideoAnalyseRule[0][1].Enable={}", on)));
        }
        (CHANNEL_ACTIVATE_ALARM_OUTPUT, on) => {
            return Some(set_config(&format!("AlarmOut[0].Mode={}", u8::from(on))));
        }
        (CHANNEL_ACTIVATE_ALARM_OUTPUT2, on) => {
            return Some(set_config(&format!("AlarmOut[1].Mode={}", u8::from(on))));
        }
        (CHANNEL_ENABLE_LED, true) => "Lighting[0][0].Mode=Manual",
        (CHANNEL_ENABLE_LED, false) => "Lighting[0][0].Mode=Off",
        // Turning auto mode off has no camera counterpart; the LED keeps its last mode
        (CHANNEL_AUTO_LED, true) => "Lighting[0][0].Mode=Auto",
        _ => return None,
    };
    Some(set_config(settings))
}

/// Request path that sets the LED brightness; 0 turns the LED off
pub fn led_level_path(level: u8) -> String {
    match level.min(100) {
        0 => set_config("Lighting[0][0].Mode=Off"),
        level => set_config(&format!(
            "Lighting[0][0].Mode=Manual&Lighting[0][0].MiddleLight[0].Light={}",
            level
        )),
    }
}

/// Request path that shows `text` as a video overlay; empty text hides it
pub fn text_overlay_path(text: &str) -> String {
    if text.is_empty() {
        return set_config("VideoWidget[0].CustomTitle[1].EncodeBlend=false");
    }
    let encoded: String = url::form_urlencoded::byte_serialize(text.as_bytes()).collect();
    set_config(&format!(
        "VideoWidget[0].CustomTitle[1].EncodeBlend=true&VideoWidget[0].CustomTitle[1].Text={}",
        encoded
    ))
}

/// Request path that sets the audio alarm threshold; the camera rejects 0
pub fn audio_threshold_path(threshold: u8) -> String {
    set_config(&format!("AudioDetect[0].MutationThreold={}", threshold.max(1)))
}

fn set_config(settings: &str) -> String {
    format!("{}?action=setConfig&{}", CONFIG_MANAGER, settings)
}
