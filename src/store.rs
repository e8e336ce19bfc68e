use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::types::{Event, Service, ServiceKey, Snapshot};

/// Minimum bound on a subscriber's delivery channel (spec: "bounded
/// (>=64 slots)").
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

struct StoreState {
    services: HashMap<ServiceKey, Service>,
    subscribers: HashMap<u64, mpsc::Sender<Arc<Event>>>,
    cluster_connected: bool,
    last_cluster_event: Option<DateTime<Utc>>,
    config_errors: Vec<String>,
}

impl StoreState {
    fn new() -> Self {
        StoreState {
            services: HashMap::new(),
            subscribers: HashMap::new(),
            cluster_connected: false,
            last_cluster_event: None,
            config_errors: Vec::new(),
        }
    }

    /// Non-blocking fan-out. A full subscriber channel silently drops the
    /// event for that subscriber; a closed one (receiver dropped, e.g. the
    /// client disconnected) is garbage-collected here rather than tracked
    /// separately, since every mutation already walks the subscriber set.
    fn emit(&mut self, event: Event) {
        let event = Arc::new(event);
        self.subscribers.retain(|_, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// In-memory `(namespace,name) -> Service` map with multi-subscriber
/// event fan-out. Cheaply `Clone`-able; every clone shares the same
/// underlying lock-guarded state, mirroring the teacher's
/// `Arc<RwLock<Diagnostics>>` shared-state pattern generalized from a
/// single diagnostics struct to the full service map.
#[derive(Clone)]
pub struct ServiceStore {
    inner: Arc<RwLock<StoreState>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl ServiceStore {
    pub fn new() -> Self {
        ServiceStore {
            inner: Arc::new(RwLock::new(StoreState::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Insert new or replace existing. Emits `Discovered` on insert,
    /// `Updated` on replace.
    pub async fn add_or_update(&self, svc: Service) {
        let key = svc.key();
        let mut state = self.inner.write().await;
        let is_new = !state.services.contains_key(&key);
        state.services.insert(key, svc.clone());
        let event = if is_new {
            Event::Discovered(svc)
        } else {
            Event::Updated(svc)
        };
        state.emit(event);
    }

    /// No-op and silent if absent. Emits `Removed` if present.
    pub async fn remove(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.inner.write().await;
        if state.services.remove(&key).is_some() {
            state.emit(Event::Removed(key));
        }
    }

    /// Returns a deep copy.
    pub async fn get(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.inner.read().await;
        state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Snapshot: deep copies, order unspecified.
    pub async fn all(&self) -> Vec<Service> {
        let state = self.inner.read().await;
        state.services.values().cloned().collect()
    }

    /// Atomic read-modify-write under the store lock. `f` is not invoked
    /// if the service is absent. Emits `Updated` iff `f` ran. Returns
    /// whether the service existed.
    pub async fn update<F>(&self, namespace: &str, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Service),
    {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.inner.write().await;
        let snapshot = match state.services.get_mut(&key) {
            Some(svc) => {
                f(svc);
                svc.clone()
            }
            None => return false,
        };
        state.emit(Event::Updated(snapshot));
        true
    }

    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<Event>>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = self.inner.write().await;
        state.subscribers.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut state = self.inner.write().await;
        state.subscribers.remove(&id);
    }

    /// Subscribes before taking the snapshot, under the same lock
    /// acquisition, so there is no window in which a concurrent mutation
    /// between snapshot and subscribe could be lost.
    pub async fn subscribe_with_snapshot(&self) -> (u64, mpsc::Receiver<Arc<Event>>, Snapshot) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = self.inner.write().await;
        state.subscribers.insert(id, tx);
        let snapshot = Snapshot {
            services: state.services.values().cloned().collect(),
            cluster_connected: state.cluster_connected,
            last_cluster_event: state.last_cluster_event,
            config_errors: state.config_errors.clone(),
        };
        (id, rx, snapshot)
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.read().await;
        Snapshot {
            services: state.services.values().cloned().collect(),
            cluster_connected: state.cluster_connected,
            last_cluster_event: state.last_cluster_event,
            config_errors: state.config_errors.clone(),
        }
    }

    /// Emits `ClusterStatus` on every call, to surface liveness ticks even
    /// when connectivity does not change.
    pub async fn set_cluster_connected(&self, connected: bool) {
        let mut state = self.inner.write().await;
        state.cluster_connected = connected;
        state.last_cluster_event = Some(Utc::now());
        let last_event = state.last_cluster_event;
        state.emit(Event::ClusterStatus { connected, last_event });
    }

    pub async fn cluster_connected(&self) -> bool {
        self.inner.read().await.cluster_connected
    }

    pub async fn last_cluster_event(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_cluster_event
    }

    /// Emits `ConfigErrorsChanged` only when the slice value differs.
    pub async fn set_config_errors(&self, errors: Vec<String>) {
        let mut state = self.inner.write().await;
        if state.config_errors != errors {
            state.config_errors = errors.clone();
            state.emit(Event::ConfigErrorsChanged(errors));
        }
    }

    pub async fn config_errors(&self) -> Vec<String> {
        self.inner.read().await.config_errors.clone()
    }

    /// Closes every registered subscriber channel (global shutdown).
    pub async fn shutdown(&self) {
        let mut state = self.inner.write().await;
        state.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }
}

impl Default for ServiceStore {
    fn default() -> Self {
        Self::new()
    }
}
