use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Timeout applied to every REST call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for opening the event socket
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay before reopening a dropped event socket
pub const RECONNECT_DELAY: Duration = Duration::from_secs(20);

/// Delay before the first background discovery scan
pub const DISCOVERY_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Fixed delay between background discovery scans
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);

/// Bridge configuration as supplied by the host
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Controller address (IP or hostname)
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// How often handlers should refresh unit state, in seconds
    #[serde(default = "default_status_refresh")]
    pub status_refresh_time: u64,

    /// Offer units that belong to secondary controllers during discovery
    #[serde(default)]
    pub add_secondary_units: bool,
}

fn default_port() -> u16 {
    80
}

fn default_status_refresh() -> u64 {
    30
}

impl BridgeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            status_refresh_time: default_status_refresh(),
            add_secondary_units: false,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_secondary_units(mut self, include: bool) -> Self {
        self.add_secondary_units = include;
        self
    }

    /// Check that host and port form a usable controller address
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(GatewayError::Config("host is not set".to_string()));
        }
        if self.port == 0 {
            return Err(GatewayError::Config("port must be non-zero".to_string()));
        }

        let url = Url::parse(&format!("http://{}:{}", host, self.port))
            .map_err(|e| GatewayError::Config(format!("invalid host {}: {}", host, e)))?;
        if url.host_str().is_none() || url.path() != "/" {
            return Err(GatewayError::Config(format!("invalid host {}", host)));
        }
        Ok(())
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status_refresh_time)
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("status_refresh_time", &self.status_refresh_time)
            .field("add_secondary_units", &self.add_secondary_units)
            .finish()
    }
}
