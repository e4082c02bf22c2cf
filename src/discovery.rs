use crate::client::RestClient;
use crate::config::{DISCOVERY_INITIAL_DELAY, DISCOVERY_INTERVAL};
use crate::protocol::{parse_unit_list, UnitEntry};
use crate::types::{DiscoveryResult, UnitType};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Host-side sink for discovery results
pub trait DiscoveryListener: Send + Sync {
    fn thing_discovered(&self, result: &DiscoveryResult);

    /// A previously offered result went stale and was evicted
    fn thing_removed(&self, _thing_uid: &str) {}
}

/// Scan cadence and filtering
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Delay before the first background scan. Default: 5s.
    pub initial_delay: Duration,

    /// Fixed delay between background scans. Default: 120s.
    pub interval: Duration,

    /// Offer units that belong to secondary controllers
    pub include_secondary: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay: DISCOVERY_INITIAL_DELAY,
            interval: DISCOVERY_INTERVAL,
            include_secondary: false,
        }
    }
}

struct BackgroundJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct DiscoveryInner {
    client: Arc<RestClient>,
    bridge_uid: String,
    config: DiscoveryConfig,
    active: AtomicBool,
    results: Mutex<BTreeMap<String, DiscoveryResult>>,
    listeners: Mutex<Vec<Arc<dyn DiscoveryListener>>>,
    last_completed_scan: Mutex<Option<DateTime<Utc>>>,
    background: Mutex<Option<BackgroundJob>>,
}

/// Background discovery of a controller's units
///
/// Polls the controller's inventory, offers every supported unit to the
/// registered [`DiscoveryListener`]s and forgets results that a later scan
/// no longer reports, so a removed device does not resurface from the cache.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use touchwand::{Discovery, DiscoveryConfig, RestClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Arc::new(RestClient::new()?);
///     client.connect("admin", "secret", "192.168.1.20", 80).await;
///
///     let discovery = Discovery::new(client, "touchwand:bridge:home", DiscoveryConfig::default());
///     discovery.activate();
///     for result in discovery.start_scan().await {
///         println!("Found {} ({})", result.label, result.thing_uid);
///     }
///     discovery.deactivate();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    pub fn new(client: Arc<RestClient>, bridge_uid: impl Into<String>, config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                client,
                bridge_uid: bridge_uid.into(),
                config,
                active: AtomicBool::new(false),
                results: Mutex::new(BTreeMap::new()),
                listeners: Mutex::new(Vec::new()),
                last_completed_scan: Mutex::new(None),
                background: Mutex::new(None),
            }),
        }
    }

    pub fn bridge_uid(&self) -> &str {
        &self.inner.bridge_uid
    }

    pub fn add_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        lock(&self.inner.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DiscoveryListener>) {
        lock(&self.inner.listeners)
            .retain(|l| !std::ptr::eq(Arc::as_ptr(l) as *const (), Arc::as_ptr(listener) as *const ()));
    }

    /// Snapshot of the current results
    pub fn results(&self) -> Vec<DiscoveryResult> {
        lock(&self.inner.results).values().cloned().collect()
    }

    /// Start time of the most recent scan that completed
    pub fn last_scan_timestamp(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_completed_scan)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Enable scanning and drop everything cached for this bridge
    pub fn activate(&self) {
        self.remove_older_results(Utc::now());
        self.inner.active.store(true, Ordering::SeqCst);
        tracing::debug!("Activate discovery service for {}", self.inner.bridge_uid);
    }

    /// Stop background scans, disable scanning and drop cached results
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.stop_background_discovery();
        self.remove_older_results(Utc::now());
        tracing::debug!("Deactivate discovery service for {}", self.inner.bridge_uid);
    }

    /// Run one scan and return the results it produced.
    ///
    /// An unreachable controller or an unparseable inventory yields no
    /// results and leaves the cache untouched; the next cycle tries again.
    pub async fn start_scan(&self) -> Vec<DiscoveryResult> {
        if !self.is_active() {
            tracing::debug!("Discovery for {} is not active, skipping scan", self.inner.bridge_uid);
            return Vec::new();
        }

        if let Some(last) = self.last_scan_timestamp() {
            self.remove_older_results(last);
        }

        let scan_started = Utc::now();
        tracing::debug!("Starting TouchWand discovery on bridge {}", self.inner.bridge_uid);

        let response = match self.inner.client.list_units().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Could not list units on {}: {}", self.inner.bridge_uid, e);
                return Vec::new();
            }
        };
        tracing::debug!("Received list units response {}", response);

        let entries = match parse_unit_list(&response) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Could not parse list units response: {}", e);
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for (unit_id, name, unit_type) in select_units(entries, self.inner.config.include_secondary) {
            let result = DiscoveryResult::new(&self.inner.bridge_uid, &unit_id, &name, unit_type, Utc::now());
            self.record(result.clone());
            found.push(result);
        }

        self.stop_scan(scan_started);
        tracing::info!("Discovery on {} found {} unit(s)", self.inner.bridge_uid, found.len());
        found
    }

    /// Start the recurring scan; does nothing if it is already running
    pub fn start_background_discovery(&self) -> bool {
        let mut background = lock(&self.inner.background);
        if background.as_ref().is_some_and(|job| !job.handle.is_finished()) {
            return false;
        }

        tracing::debug!("Start TouchWand units background discovery");
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let discovery = self.clone();
        let initial_delay = self.inner.config.initial_delay;
        let interval = self.inner.config.interval;

        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = discovery.start_scan() => {}
                }
                delay = interval;
            }
            tracing::debug!("Background discovery loop for {} ended", discovery.inner.bridge_uid);
        });

        *background = Some(BackgroundJob { cancel, handle });
        true
    }

    /// Cancel the recurring scan; safe to call when it is not running
    pub fn stop_background_discovery(&self) {
        if let Some(job) = lock(&self.inner.background).take() {
            tracing::debug!("Stop TouchWand device units discovery");
            job.cancel.cancel();
            job.handle.abort();
        }
    }

    pub fn is_background_running(&self) -> bool {
        lock(&self.inner.background)
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }

    /// Evict this bridge's results discovered before `before`
    pub fn remove_older_results(&self, before: DateTime<Utc>) -> usize {
        let removed: Vec<String> = {
            let mut results = lock(&self.inner.results);
            let stale: Vec<String> = results
                .values()
                .filter(|r| r.bridge_uid == self.inner.bridge_uid && r.timestamp < before)
                .map(|r| r.thing_uid.clone())
                .collect();
            for uid in &stale {
                results.remove(uid);
            }
            stale
        };

        if !removed.is_empty() {
            let listeners = lock(&self.inner.listeners).clone();
            for uid in &removed {
                tracing::debug!("Removing stale discovery result {}", uid);
                for listener in &listeners {
                    listener.thing_removed(uid);
                }
            }
        }
        removed.len()
    }

    fn stop_scan(&self, scan_started: DateTime<Utc>) {
        // Overlapping scans may finish out of order; the mark never moves back.
        let completed = {
            let mut last = lock(&self.inner.last_completed_scan);
            let completed = last.map_or(scan_started, |prev| prev.max(scan_started));
            *last = Some(completed);
            completed
        };
        self.remove_older_results(completed);
    }

    fn record(&self, result: DiscoveryResult) {
        let is_new = {
            let mut results = lock(&self.inner.results);
            let is_new = results
                .get(&result.thing_uid)
                .map_or(true, |old| old.label != result.label || old.thing_type != result.thing_type);
            results.insert(result.thing_uid.clone(), result.clone());
            is_new
        };

        if is_new {
            let listeners = lock(&self.inner.listeners).clone();
            for listener in &listeners {
                listener.thing_discovered(&result);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Filter inventory entries down to `(id, name, type)` of supported units
fn select_units(entries: Vec<UnitEntry>, include_secondary: bool) -> Vec<(String, String, UnitType)> {
    let mut units = Vec::new();
    for entry in entries {
        if !include_secondary && entry.is_secondary() {
            tracing::debug!("Skipped secondary controller unit: {} idData {:?}", entry.name, entry.id_data);
            continue;
        }

        let Some(unit_id) = entry.id_string() else {
            tracing::debug!("Skipped unit without usable id: {}", entry.name);
            continue;
        };
        let Some(unit_type) = UnitType::from_wire(&entry.unit_type) else {
            tracing::debug!("Skipped unit {} of unsupported type {}", unit_id, entry.unit_type);
            continue;
        };

        tracing::debug!(
            "id is {} name {} type {} connectivity {:?}",
            unit_id,
            entry.name,
            entry.unit_type,
            entry.connectivity
        );
        units.push((unit_id, entry.name, unit_type));
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink {
        discovered: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl DiscoveryListener for Sink {
        fn thing_discovered(&self, result: &DiscoveryResult) {
            self.discovered.lock().unwrap().push(result.thing_uid.clone());
        }

        fn thing_removed(&self, thing_uid: &str) {
            self.removed.lock().unwrap().push(thing_uid.to_string());
        }
    }

    const INVENTORY: &str = r#"[
        {"id":1,"name":"Lamp","type":"Switch","connectivity":"Zwave","idData":{}},
        {"id":2,"name":"Blind","type":"shutter","idData":null},
        {"id":3,"name":"Remote lamp","type":"Switch","idData":{"controller":"b"}},
        {"id":4,"name":"Heater","type":"Thermostat","idData":{}}
    ]"#;

    fn discovery() -> Discovery {
        let client = Arc::new(RestClient::new().unwrap());
        Discovery::new(client, "touchwand:bridge:home", DiscoveryConfig::default())
    }

    #[test]
    fn secondary_units_follow_the_flag() {
        let primary = select_units(parse_unit_list(INVENTORY).unwrap(), false);
        let ids: Vec<&str> = primary.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        let all = select_units(parse_unit_list(INVENTORY).unwrap(), true);
        let ids: Vec<&str> = all.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn unsupported_types_are_skipped() {
        let units = select_units(parse_unit_list(INVENTORY).unwrap(), true);
        assert!(units.iter().all(|(_, name, _)| name != "Heater"));
        assert_eq!(units[1].2, UnitType::Shutter);
    }

    #[tokio::test]
    async fn duplicate_results_are_reported_once() {
        let discovery = discovery();
        let sink = Arc::new(Sink::default());
        discovery.add_listener(sink.clone());

        let result = DiscoveryResult::new("touchwand:bridge:home", "1", "Lamp", UnitType::Switch, Utc::now());
        discovery.record(result.clone());
        discovery.record(result);
        assert_eq!(sink.discovered.lock().unwrap().len(), 1);
        assert_eq!(discovery.results().len(), 1);
    }

    #[tokio::test]
    async fn results_older_than_cutoff_are_evicted() {
        let discovery = discovery();
        let sink = Arc::new(Sink::default());
        discovery.add_listener(sink.clone());

        let old = Utc::now() - chrono::Duration::seconds(300);
        discovery.record(DiscoveryResult::new("touchwand:bridge:home", "1", "Lamp", UnitType::Switch, old));
        discovery.record(DiscoveryResult::new("touchwand:bridge:home", "2", "Blind", UnitType::Shutter, Utc::now()));

        let removed = discovery.remove_older_results(Utc::now() - chrono::Duration::seconds(60));
        assert_eq!(removed, 1);
        assert_eq!(*sink.removed.lock().unwrap(), vec!["touchwand:switch:home:1".to_string()]);
        assert_eq!(discovery.results().len(), 1);
    }

    #[tokio::test]
    async fn activate_and_deactivate_purge_the_cache() {
        let discovery = discovery();
        discovery.record(DiscoveryResult::new("touchwand:bridge:home", "1", "Lamp", UnitType::Switch, Utc::now()));
        discovery.activate();
        assert!(discovery.results().is_empty());
        assert!(discovery.is_active());

        discovery.record(DiscoveryResult::new("touchwand:bridge:home", "2", "Blind", UnitType::Shutter, Utc::now()));
        discovery.deactivate();
        assert!(discovery.results().is_empty());
        assert!(!discovery.is_active());
    }

    #[tokio::test]
    async fn inactive_discovery_does_not_scan() {
        let discovery = discovery();
        assert!(discovery.start_scan().await.is_empty());
        assert!(discovery.last_scan_timestamp().is_none());
    }

    #[tokio::test]
    async fn scan_mark_never_moves_backwards() {
        let discovery = discovery();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);

        discovery.stop_scan(later);
        discovery.stop_scan(earlier);
        assert_eq!(discovery.last_scan_timestamp(), Some(later));
    }

    #[tokio::test(start_paused = true)]
    async fn background_discovery_is_idempotent() {
        let discovery = discovery();
        assert!(discovery.start_background_discovery());
        assert!(!discovery.start_background_discovery());
        assert!(discovery.is_background_running());

        discovery.stop_background_discovery();
        discovery.stop_background_discovery();
        assert!(!discovery.is_background_running());

        assert!(discovery.start_background_discovery());
        discovery.deactivate();
        assert!(!discovery.is_background_running());
    }
}
