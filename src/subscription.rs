use crate::error::{GatewayError, Result};
use crate::types::{UnitData, UnitId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Callback interface for unit updates coming off the event stream
pub trait UnitStatusListener: Send + Sync {
    /// Called synchronously on the socket task; must not block for long.
    fn on_data_received(&self, unit: &UnitData);
}

/// Callback interface for a handler bound to a single unit
pub trait UnitUpdateListener: Send + Sync {
    /// Id of the unit this listener handles
    fn unit_id(&self) -> &str;

    fn on_item_status_update(&self, unit: &UnitData);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_listener(a: &Arc<dyn UnitStatusListener>, b: &Arc<dyn UnitStatusListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Ordered set of distinct listeners
///
/// Identity is the `Arc` allocation, so registering the same listener twice
/// is a no-op. Dispatch works on a snapshot, which makes it safe to register
/// or unregister from another thread (or from inside a callback) while a
/// dispatch is running.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<Mutex<Vec<Arc<dyn UnitStatusListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; returns `false` if it was already registered
    pub fn register(&self, listener: Arc<dyn UnitStatusListener>) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        tracing::debug!("Adding unit status listener");
        listeners.push(listener);
        true
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn unregister(&self, listener: &Arc<dyn UnitStatusListener>) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        tracing::debug!("Removing unit status listener");
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener in registration order; returns how many ran
    pub fn dispatch(&self, unit: &UnitData) -> usize {
        let snapshot: Vec<_> = lock(&self.listeners).clone();
        for listener in &snapshot {
            listener.on_data_received(unit);
        }
        snapshot.len()
    }
}

/// Routes unit updates to the handler registered for that unit id
#[derive(Default)]
pub struct UnitRouter {
    listeners: Mutex<HashMap<UnitId, Arc<dyn UnitUpdateListener>>>,
}

impl UnitRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns `false` if the unit already has one
    pub fn register(&self, listener: Arc<dyn UnitUpdateListener>) -> bool {
        let id = listener.unit_id().to_string();
        tracing::debug!(unit_id = %id, "Adding status update listener");
        let mut listeners = lock(&self.listeners);
        if listeners.contains_key(&id) {
            return false;
        }
        listeners.insert(id, listener);
        true
    }

    pub fn unregister(&self, listener: &dyn UnitUpdateListener) -> bool {
        tracing::debug!(unit_id = %listener.unit_id(), "Removing status update listener");
        lock(&self.listeners).remove(listener.unit_id());
        true
    }

    /// Ids of every unit that currently has a handler
    pub fn unit_ids(&self) -> Vec<UnitId> {
        lock(&self.listeners).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UnitStatusListener for UnitRouter {
    fn on_data_received(&self, unit: &UnitData) {
        let listener = lock(&self.listeners).get(&unit.id).cloned();
        if let Some(listener) = listener {
            listener.on_item_status_update(unit);
        }
    }
}

/// Async receiver for unit updates
///
/// An alternative to [`UnitStatusListener`] for consumers that prefer to
/// await updates instead of being called back.
pub struct UnitReceiver {
    rx: broadcast::Receiver<UnitData>,
}

impl UnitReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<UnitData>) -> Self {
        Self { rx }
    }

    /// Receive the next unit update
    ///
    /// Fails with `ConnectionClosed` once the event stream is gone.
    pub async fn recv(&mut self) -> Result<UnitData> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => GatewayError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                GatewayError::InvalidResponse(format!("Lagged by {} updates", n))
            }
        })
    }

    /// Try to receive an update without waiting
    ///
    /// Returns `None` if no update is queued.
    pub fn try_recv(&mut self) -> Result<Option<UnitData>> {
        match self.rx.try_recv() {
            Ok(unit) => Ok(Some(unit)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(GatewayError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(GatewayError::InvalidResponse(format!("Lagged by {} updates", n)))
            }
        }
    }
}
