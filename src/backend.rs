use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::wire::BackendView;

/// A registered backend: an immutable identity (its URL) plus mutable
/// health/load state updated by heartbeats and probes.
///
/// Equality and hashing are by URL only; port is informational (§3).
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    pub port: Option<u16>,
    healthy: AtomicBool,
    in_flight_requests: AtomicU64,
    rif_avg_latency: AtomicU64,
    overall_avg_latency: AtomicU64,
}

impl Backend {
    pub fn new(url: impl Into<String>, port: Option<u16>, healthy: bool) -> Self {
        Self {
            url: url.into(),
            port,
            healthy: AtomicBool::new(healthy),
            in_flight_requests: AtomicU64::new(0.0f64.to_bits()),
            rif_avg_latency: AtomicU64::new(0.0f64.to_bits()),
            overall_avg_latency: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, value: bool) {
        self.healthy.store(value, Ordering::Release);
    }

    pub fn in_flight_requests(&self) -> f64 {
        f64::from_bits(self.in_flight_requests.load(Ordering::Acquire))
    }

    pub fn set_in_flight_requests(&self, value: f64) {
        self.in_flight_requests.store(value.to_bits(), Ordering::Release);
    }

    pub fn rif_avg_latency(&self) -> f64 {
        f64::from_bits(self.rif_avg_latency.load(Ordering::Acquire))
    }

    pub fn set_rif_avg_latency(&self, value: f64) {
        self.rif_avg_latency.store(value.to_bits(), Ordering::Release);
    }

    pub fn overall_avg_latency(&self) -> f64 {
        f64::from_bits(self.overall_avg_latency.load(Ordering::Acquire))
    }

    pub fn set_overall_avg_latency(&self, value: f64) {
        self.overall_avg_latency.store(value.to_bits(), Ordering::Release);
    }

    pub fn to_view(&self) -> BackendView {
        BackendView {
            url: self.url.clone(),
            port: self.port,
            healthy: self.is_healthy(),
            in_flight_requests: self.in_flight_requests(),
            rif_avg_latency: self.rif_avg_latency(),
            overall_avg_latency: self.overall_avg_latency(),
        }
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Backend {}

impl Hash for Backend {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Bookkeeping kept alongside a backend but not part of its identity: the
/// last time we heard a heartbeat from it, used by the registry's TTL check.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatStamp(pub Instant);

impl HeartbeatStamp {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub fn is_stale(&self, timeout: std::time::Duration) -> bool {
        self.0.elapsed() > timeout
    }
}
