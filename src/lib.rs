//! Rust library for TouchWand home-automation controllers
//!
//! This library provides an async API for talking to a TouchWand controller
//! on the local network. It supports:
//!
//! - Login and unit commands over the controller's REST API
//! - Real-time unit updates over the `/async` WebSocket, with automatic reconnect
//! - Periodic discovery of the controller's units
//! - Per-unit update routing for device handlers
//! - Mapping of unit payloads onto channel states
//! - Parsing of camera alarm notifications
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use touchwand::{Bridge, BridgeConfig, BridgeStatus, UnitCommand, UnitData, UnitUpdateListener};
//!
//! struct Lamp;
//!
//! impl UnitUpdateListener for Lamp {
//!     fn unit_id(&self) -> &str {
//!         "7"
//!     }
//!
//!     fn on_item_status_update(&self, unit: &UnitData) {
//!         println!("Lamp is now {:?}", unit.curr_status);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::new("192.168.1.20", 80).with_credentials("admin", "secret");
//!     let bridge = Bridge::new("touchwand:bridge:home", config)?;
//!     bridge.register_update_listener(Arc::new(Lamp));
//!
//!     if bridge.initialize().await == BridgeStatus::Online {
//!         bridge.send_command("7", UnitCommand::SwitchOn).await?;
//!
//!         // Give discovery a chance to run
//!         tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!         if let Some(discovery) = bridge.discovery() {
//!             for result in discovery.results() {
//!                 println!("Found {} ({})", result.label, result.thing_uid);
//!             }
//!         }
//!     }
//!
//!     bridge.dispose();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Bridge**: Ties login, discovery and the event stream together
//! - **Client**: REST session and unit commands
//! - **Connection**: Event socket state machine and reconnect scheduling
//! - **Discovery**: Periodic inventory scans and stale-result eviction
//! - **Subscription**: Listener registries and update routing
//! - **Protocol**: JSON message structures
//! - **Types**: Domain types and data structures

pub mod alarm;
mod bridge;
pub mod channel;
mod client;
mod config;
mod connection;
mod discovery;
mod error;
mod protocol;
mod subscription;
mod types;

// Public exports
pub use bridge::Bridge;
pub use client::RestClient;
pub use config::{
    BridgeConfig, CONNECT_TIMEOUT, DISCOVERY_INITIAL_DELAY, DISCOVERY_INTERVAL, RECONNECT_DELAY, REQUEST_TIMEOUT,
};
pub use connection::{ConnectionState, EventStream, SocketEvent, StreamConfig};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryListener};
pub use error::{GatewayError, Result};
pub use protocol::{parse_event, parse_unit, parse_unit_list, Event, UnitCommand, UnitEntry};
pub use subscription::{ListenerSet, UnitReceiver, UnitRouter, UnitStatusListener, UnitUpdateListener};
pub use types::{
    thing_uid, AlarmSensorStatus, BinarySensorEvent, BinarySensorState, BridgeStatus, DiscoveryResult,
    SensorReading, UnitData, UnitId, UnitStatus, UnitType, BINDING_ID, SENSOR_TYPE_DOOR_WINDOW, SENSOR_TYPE_LEAK,
    SENSOR_TYPE_LUMINANCE, SENSOR_TYPE_MOTION, SENSOR_TYPE_TEMPERATURE,
};
