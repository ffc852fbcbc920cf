//! Backend Registry (§4.A): authoritative set of backends with
//! heartbeat-driven health, guarded by a single mutex over a URL-keyed map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{Backend, HeartbeatStamp};
use crate::error::RegistryError;
use crate::wire::{BackendView, RegisterRequest};

struct Entry {
    backend: Arc<Backend>,
    last_heartbeat: HeartbeatStamp,
}

/// Seam for an external durable backing store (§4.A: "an optional backing
/// by an external durable key-value store is supported"). The in-memory
/// registry below is the only implementation this crate builds out; a
/// Redis-backed (or similar) `RegistryStore` can be dropped in without
/// touching callers.
pub trait RegistryStore: Send + Sync {
    fn put(&self, url: &str, view: &BackendView) -> Result<(), RegistryError>;
    fn remove(&self, url: &str) -> Result<(), RegistryError>;
}

pub struct BackendRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    heartbeat_timeout: Duration,
    store: Option<Arc<dyn RegistryStore>>,
}

impl BackendRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            store: None,
        }
    }

    pub fn with_store(heartbeat_timeout: Duration, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            store: Some(store),
        }
    }

    /// Upsert by URL. Preserves observed metric fields on an existing entry
    /// when the incoming request doesn't supply them; always adopts the
    /// incoming `health` flag and refreshes the heartbeat stamp.
    pub fn register(&self, req: RegisterRequest) -> Result<BackendView, RegistryError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;

        let backend = match entries.get(&req.url) {
            Some(existing) => {
                let backend = existing.backend.clone();
                backend.set_healthy(req.health);
                if let Some(v) = req.in_flight_requests {
                    backend.set_in_flight_requests(v);
                }
                if let Some(v) = req.rif_avg_latency {
                    backend.set_rif_avg_latency(v);
                }
                if let Some(v) = req.overall_avg_latency {
                    backend.set_overall_avg_latency(v);
                }
                backend
            }
            None => {
                let backend = Arc::new(Backend::new(req.url.clone(), req.port, req.health));
                backend.set_in_flight_requests(req.in_flight_requests.unwrap_or(0.0));
                backend.set_rif_avg_latency(req.rif_avg_latency.unwrap_or(0.0));
                backend.set_overall_avg_latency(req.overall_avg_latency.unwrap_or(0.0));
                backend
            }
        };

        entries.insert(
            req.url.clone(),
            Entry {
                backend: backend.clone(),
                last_heartbeat: HeartbeatStamp::now(),
            },
        );

        let view = backend.to_view();
        if let Some(store) = &self.store {
            store.put(&req.url, &view)?;
        }
        info!(url = %req.url, healthy = req.health, "backend registered");
        Ok(view)
    }

    pub fn unregister(&self, url: &str) -> Result<Option<BackendView>, RegistryError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;

        let removed = entries.remove(url).map(|e| e.backend.to_view());
        if let Some(store) = &self.store {
            store.remove(url)?;
        }
        info!(url, "backend unregistered");
        Ok(removed)
    }

    /// All known backends, applying the heartbeat-TTL transition on read:
    /// any entry whose last heartbeat is older than the timeout is reported
    /// (and marked) unhealthy. The edge is logged only on the transition.
    pub fn list(&self) -> Vec<Arc<Backend>> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };

        entries
            .values()
            .map(|entry| {
                if entry.backend.is_healthy() && entry.last_heartbeat.is_stale(self.heartbeat_timeout) {
                    entry.backend.set_healthy(false);
                    warn!(url = %entry.backend.url, "backend heartbeat expired, marking unhealthy");
                }
                entry.backend.clone()
            })
            .collect()
    }

    pub fn list_healthy(&self) -> Vec<Arc<Backend>> {
        self.list().into_iter().filter(|b| b.is_healthy()).collect()
    }

    /// Idempotent setter. Returns `true` if the URL was known.
    pub fn mark_unhealthy(&self, url: &str) -> bool {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(url) {
            Some(entry) => {
                if entry.backend.is_healthy() {
                    warn!(url, "backend marked unhealthy");
                }
                entry.backend.set_healthy(false);
                true
            }
            None => false,
        }
    }

    /// O(1) read path for the forwarder's circuit-breaker gate: a single
    /// map lookup, no allocation, no full-table iteration. Also applies the
    /// heartbeat-TTL transition for this one URL.
    pub fn is_healthy(&self, url: &str) -> bool {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(url) {
            Some(entry) => {
                if entry.last_heartbeat.is_stale(self.heartbeat_timeout) {
                    if entry.backend.is_healthy() {
                        warn!(url, "backend heartbeat expired, marking unhealthy");
                    }
                    entry.backend.set_healthy(false);
                    false
                } else {
                    entry.backend.is_healthy()
                }
            }
            None => false,
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<Backend>> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(url).map(|e| e.backend.clone())
    }
}
