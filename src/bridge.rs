use crate::client::RestClient;
use crate::config::BridgeConfig;
use crate::connection::{EventStream, StreamConfig};
use crate::discovery::{Discovery, DiscoveryConfig};
use crate::error::Result;
use crate::protocol::{parse_unit, UnitCommand};
use crate::subscription::{UnitRouter, UnitStatusListener, UnitUpdateListener};
use crate::types::{BridgeStatus, UnitData};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RefreshJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Connection to one TouchWand controller
///
/// Owns the REST client, the discovery scanner and the event stream, and
/// routes unit updates to the handler registered for each unit.
///
/// # Example
///
/// ```no_run
/// use touchwand::{Bridge, BridgeConfig, BridgeStatus};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = BridgeConfig::new("192.168.1.20", 80).with_credentials("admin", "secret");
///     let bridge = Bridge::new("touchwand:bridge:home", config)?;
///
///     if bridge.initialize().await == BridgeStatus::Online {
///         println!("Controller is online");
///     }
///     bridge.dispose();
///     Ok(())
/// }
/// ```
pub struct Bridge {
    uid: String,
    config: BridgeConfig,
    client: Arc<RestClient>,
    router: Arc<UnitRouter>,
    router_listener: Arc<dyn UnitStatusListener>,
    stream_config: StreamConfig,
    discovery_config: DiscoveryConfig,
    status: Mutex<BridgeStatus>,
    stream: Mutex<Option<EventStream>>,
    discovery: Mutex<Option<Discovery>>,
    refresh: Mutex<Option<RefreshJob>>,
}

impl Bridge {
    pub fn new(uid: impl Into<String>, config: BridgeConfig) -> Result<Self> {
        let router = Arc::new(UnitRouter::new());
        let discovery_config = DiscoveryConfig {
            include_secondary: config.add_secondary_units,
            ..DiscoveryConfig::default()
        };

        Ok(Self {
            uid: uid.into(),
            config,
            client: Arc::new(RestClient::new()?),
            router_listener: router.clone(),
            router,
            stream_config: StreamConfig::default(),
            discovery_config,
            status: Mutex::new(BridgeStatus::Unknown),
            stream: Mutex::new(None),
            discovery: Mutex::new(None),
            refresh: Mutex::new(None),
        })
    }

    /// Override the event stream timing
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    /// Override the scan cadence; the secondary-unit flag still comes from the bridge config
    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_config = DiscoveryConfig {
            include_secondary: self.config.add_secondary_units,
            ..config
        };
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn status(&self) -> BridgeStatus {
        *lock(&self.status)
    }

    /// How often registered units are polled for their state
    pub fn status_refresh(&self) -> Duration {
        self.config.status_refresh()
    }

    pub fn client(&self) -> Arc<RestClient> {
        self.client.clone()
    }

    pub fn discovery(&self) -> Option<Discovery> {
        lock(&self.discovery).clone()
    }

    pub fn event_stream(&self) -> Option<EventStream> {
        lock(&self.stream).clone()
    }

    /// Validate the config, log in and start discovery and the event stream.
    ///
    /// A bad config ends in `ConfigurationError` and a rejected or failed
    /// login in `Offline`; neither is retried here.
    pub async fn initialize(&self) -> BridgeStatus {
        if let Err(e) = self.config.validate() {
            tracing::warn!("Bridge {} configuration is not valid: {}", self.uid, e);
            return self.set_status(BridgeStatus::ConfigurationError);
        }

        let connected = self
            .client
            .connect(&self.config.username, &self.config.password, &self.config.host, self.config.port)
            .await;
        if !connected {
            tracing::warn!("Could not log in to controller at {}:{}", self.config.host, self.config.port);
            return self.set_status(BridgeStatus::Offline);
        }
        self.set_status(BridgeStatus::Online);

        let discovery = Discovery::new(self.client.clone(), self.uid.clone(), self.discovery_config.clone());
        discovery.activate();
        discovery.start_background_discovery();
        if let Some(previous) = lock(&self.discovery).replace(discovery) {
            previous.deactivate();
        }

        let stream = EventStream::with_config(&self.config.host, self.stream_config.clone());
        stream.register_listener(self.router_listener.clone());
        if let Some(previous) = lock(&self.stream).replace(stream.clone()) {
            previous.unregister_listener(&self.router_listener);
            previous.dispose();
        }
        // Failure is logged by the stream; updates resume once it is reconnected.
        let _ = stream.connect().await;

        self.start_status_refresh();
        BridgeStatus::Online
    }

    /// Fetch one unit's current state and hand it to that unit's listener
    pub async fn refresh_unit(&self, unit_id: &str) -> Result<UnitData> {
        refresh_unit(&self.client, &self.router, unit_id).await
    }

    /// Poll every registered unit once per refresh interval. A zero interval
    /// leaves polling off.
    fn start_status_refresh(&self) {
        let period = self.status_refresh();
        let mut refresh = lock(&self.refresh);
        if let Some(job) = refresh.take() {
            job.cancel.cancel();
            job.handle.abort();
        }
        if period.is_zero() {
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let client = self.client.clone();
        let router = self.router.clone();
        let uid = self.uid.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = sleep(period) => {}
                }
                for unit_id in router.unit_ids() {
                    tokio::select! {
                        biased;
                        _ = task_cancel.cancelled() => return,
                        result = refresh_unit(&client, &router, &unit_id) => {
                            if let Err(e) = result {
                                tracing::warn!(unit_id = %unit_id, "Could not refresh unit status: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::debug!("Status refresh for {} ended", uid);
        });

        *refresh = Some(RefreshJob { cancel, handle });
    }

    /// Route updates for `listener.unit_id()` to `listener`.
    ///
    /// Returns `false` if that unit already has a listener.
    pub fn register_update_listener(&self, listener: Arc<dyn UnitUpdateListener>) -> bool {
        self.router.register(listener)
    }

    pub fn unregister_update_listener(&self, listener: &dyn UnitUpdateListener) -> bool {
        self.router.unregister(listener)
    }

    /// Send a unit command through the REST client
    pub async fn send_command(&self, unit_id: &str, command: UnitCommand) -> Result<String> {
        self.client.send_command(unit_id, command).await
    }

    /// Stop discovery and close the event stream; safe to call repeatedly
    pub fn dispose(&self) {
        if let Some(job) = lock(&self.refresh).take() {
            job.cancel.cancel();
            job.handle.abort();
        }
        if let Some(discovery) = lock(&self.discovery).take() {
            discovery.deactivate();
        }
        if let Some(stream) = lock(&self.stream).take() {
            stream.unregister_listener(&self.router_listener);
            stream.dispose();
        }
        tracing::debug!("Bridge {} disposed", self.uid);
    }

    fn set_status(&self, status: BridgeStatus) -> BridgeStatus {
        *lock(&self.status) = status;
        status
    }
}

async fn refresh_unit(client: &RestClient, router: &UnitRouter, unit_id: &str) -> Result<UnitData> {
    let body = client.get_unit_by_id(unit_id).await?;
    let unit = parse_unit(&body)?;
    router.on_data_received(&unit);
    Ok(unit)
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UnitStatus, UnitType};

    struct Handler {
        id: String,
        seen: Mutex<Vec<String>>,
    }

    impl UnitUpdateListener for Handler {
        fn unit_id(&self) -> &str {
            &self.id
        }

        fn on_item_status_update(&self, unit: &UnitData) {
            self.seen.lock().unwrap().push(unit.name.clone());
        }
    }

    fn handler(id: &str) -> Arc<Handler> {
        Arc::new(Handler { id: id.into(), seen: Mutex::new(Vec::new()) })
    }

    #[tokio::test]
    async fn invalid_config_is_a_configuration_error() {
        let bridge = Bridge::new("touchwand:bridge:home", BridgeConfig::new("", 80)).unwrap();
        assert_eq!(bridge.status(), BridgeStatus::Unknown);
        assert_eq!(bridge.initialize().await, BridgeStatus::ConfigurationError);
        assert!(bridge.discovery().is_none());
        assert!(bridge.event_stream().is_none());
    }

    #[tokio::test]
    async fn unreachable_controller_is_offline() {
        // Port 9 (discard) is closed on test hosts
        let config = BridgeConfig::new("127.0.0.1", 9).with_credentials("admin", "secret");
        let bridge = Bridge::new("touchwand:bridge:home", config).unwrap();
        assert_eq!(bridge.initialize().await, BridgeStatus::Offline);
        assert!(bridge.event_stream().is_none());
    }

    #[test]
    fn update_listeners_are_keyed_by_unit() {
        let bridge = Bridge::new("touchwand:bridge:home", BridgeConfig::new("10.0.0.5", 80)).unwrap();
        let lamp = handler("7");

        assert!(bridge.register_update_listener(lamp.clone()));
        assert!(!bridge.register_update_listener(handler("7")));
        assert!(bridge.unregister_update_listener(lamp.as_ref()));
        assert!(bridge.unregister_update_listener(lamp.as_ref()));
        assert!(bridge.register_update_listener(handler("7")));
    }

    #[test]
    fn router_receives_stream_updates() {
        let bridge = Bridge::new("touchwand:bridge:home", BridgeConfig::new("10.0.0.5", 80)).unwrap();
        let lamp = handler("7");
        bridge.register_update_listener(lamp.clone());

        bridge.router_listener.on_data_received(&UnitData {
            id: "7".into(),
            name: "Hall".into(),
            unit_type: UnitType::Switch,
            status: UnitStatus::Alive,
            curr_status: None,
        });
        assert_eq!(*lamp.seen.lock().unwrap(), vec!["Hall".to_string()]);
    }

    #[test]
    fn secondary_flag_follows_bridge_config() {
        let config = BridgeConfig::new("10.0.0.5", 80).with_secondary_units(true);
        let bridge = Bridge::new("touchwand:bridge:home", config)
            .unwrap()
            .with_discovery_config(DiscoveryConfig::default());
        assert!(bridge.discovery_config.include_secondary);
    }

    #[test]
    fn dispose_twice_is_harmless() {
        let bridge = Bridge::new("touchwand:bridge:home", BridgeConfig::new("10.0.0.5", 80)).unwrap();
        bridge.dispose();
        bridge.dispose();
        assert_eq!(bridge.status(), BridgeStatus::Unknown);
    }
}
