//! Per-request backend selection (§4.F). `Chooser` is the shared contract;
//! `PrequalChooser` is the hard part, the rest are the simple variants named
//! in §9 as points of comparison.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::probe::{ProbePool, Temperature};
use crate::registry::BackendRegistry;

/// Per-request backend selection. `None` means no healthy backend is
/// available; the forwarder maps that to a 503.
pub trait Chooser: Send + Sync {
    fn get_next_backend(&self) -> Option<String>;
}

/// Hot/cold Prequal selection (§4.F): cold backends minimize latency, hot
/// backends minimize RIF, ties broken uniformly at random.
pub struct PrequalChooser {
    registry: Arc<BackendRegistry>,
    probe_pool: Arc<ProbePool>,
}

impl PrequalChooser {
    pub fn new(registry: Arc<BackendRegistry>, probe_pool: Arc<ProbePool>) -> Self {
        Self { registry, probe_pool }
    }
}

impl Chooser for PrequalChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }

        let urls: Vec<String> = healthy.iter().map(|b| b.url.clone()).collect();
        let temperatures = self.probe_pool.current_temperatures(&urls);

        let mut cold = Vec::new();
        let mut hot = Vec::new();
        for (url, temperature) in urls.iter().zip(temperatures.iter()) {
            match temperature {
                Temperature::Cold => cold.push(url.clone()),
                Temperature::Hot => hot.push(url.clone()),
            }
        }

        if !cold.is_empty() {
            let latencies = self.probe_pool.current_latencies(&cold);
            return Some(pick_min(&cold, &latencies));
        }

        let rifs = self.probe_pool.current_rifs(&hot);
        Some(pick_min(&hot, &rifs))
    }
}

/// Picks the URL with the minimum value (treating `None` as +infinity),
/// breaking ties uniformly at random among the minimizers.
fn pick_min(urls: &[String], values: &[Option<f64>]) -> String {
    let mut best_value = f64::INFINITY;
    for v in values {
        if let Some(v) = v {
            if *v < best_value {
                best_value = *v;
            }
        }
    }

    let minimizers: Vec<&String> = urls
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| v.unwrap_or(f64::INFINITY) == best_value)
        .map(|(u, _)| u)
        .collect();

    minimizers
        .choose(&mut rand::thread_rng())
        .map(|s| (*s).clone())
        .unwrap_or_else(|| urls[0].clone())
}

/// Round-robin over the currently healthy set, ignoring probe signals.
pub struct RoundRobinChooser {
    registry: Arc<BackendRegistry>,
    cursor: AtomicUsize,
}

impl RoundRobinChooser {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry, cursor: AtomicUsize::new(0) }
    }
}

impl Chooser for RoundRobinChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[index].url.clone())
    }
}

/// Uniform random selection over the healthy set.
pub struct RandomChooser {
    registry: Arc<BackendRegistry>,
}

impl RandomChooser {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

impl Chooser for RandomChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        healthy.choose(&mut rand::thread_rng()).map(|b| b.url.clone())
    }
}

/// Always picks the healthy backend with the lowest observed RIF.
pub struct LeastRifChooser {
    registry: Arc<BackendRegistry>,
    probe_pool: Arc<ProbePool>,
}

impl LeastRifChooser {
    pub fn new(registry: Arc<BackendRegistry>, probe_pool: Arc<ProbePool>) -> Self {
        Self { registry, probe_pool }
    }
}

impl Chooser for LeastRifChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }
        let urls: Vec<String> = healthy.iter().map(|b| b.url.clone()).collect();
        let rifs = self.probe_pool.current_rifs(&urls);
        Some(pick_min(&urls, &rifs))
    }
}

/// Always picks the healthy backend with the lowest observed latency.
pub struct LeastLatencyChooser {
    registry: Arc<BackendRegistry>,
    probe_pool: Arc<ProbePool>,
}

impl LeastLatencyChooser {
    pub fn new(registry: Arc<BackendRegistry>, probe_pool: Arc<ProbePool>) -> Self {
        Self { registry, probe_pool }
    }
}

impl Chooser for LeastLatencyChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }
        let urls: Vec<String> = healthy.iter().map(|b| b.url.clone()).collect();
        let latencies = self.probe_pool.current_latencies(&urls);
        Some(pick_min(&urls, &latencies))
    }
}

/// Power-of-d-choices: sample `d` healthy backends uniformly, pick the one
/// with the lowest observed RIF among the sample.
pub struct PowerOfDChooser {
    registry: Arc<BackendRegistry>,
    probe_pool: Arc<ProbePool>,
    d: usize,
}

impl PowerOfDChooser {
    pub fn new(registry: Arc<BackendRegistry>, probe_pool: Arc<ProbePool>, d: usize) -> Self {
        Self { registry, probe_pool, d: d.max(1) }
    }
}

impl Chooser for PowerOfDChooser {
    fn get_next_backend(&self) -> Option<String> {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return None;
        }
        let mut urls: Vec<String> = healthy.iter().map(|b| b.url.clone()).collect();
        urls.shuffle(&mut rand::thread_rng());
        urls.truncate(self.d.min(urls.len()));

        let rifs = self.probe_pool.current_rifs(&urls);
        Some(pick_min(&urls, &rifs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RegisterRequest;
    use std::time::Duration;

    fn registry_with(urls: &[&str]) -> Arc<BackendRegistry> {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        for url in urls {
            registry
                .register(RegisterRequest {
                    url: url.to_string(),
                    port: None,
                    health: true,
                    in_flight_requests: None,
                    rif_avg_latency: None,
                    overall_avg_latency: None,
                })
                .unwrap();
        }
        registry
    }

    #[test]
    fn no_healthy_backends_returns_none() {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(60)));
        let pool = Arc::new(ProbePool::new());
        let chooser = PrequalChooser::new(registry, pool);
        assert_eq!(chooser.get_next_backend(), None);
    }

    #[test]
    fn cold_start_picks_among_registered_urls() {
        let registry = registry_with(&["http://a", "http://b"]);
        let pool = Arc::new(ProbePool::new());
        let chooser = PrequalChooser::new(registry, pool);
        let pick = chooser.get_next_backend().unwrap();
        assert!(pick == "http://a" || pick == "http://b");
    }

    #[test]
    fn cold_set_prefers_minimum_latency() {
        let registry = registry_with(&["http://a", "http://b"]);
        let pool = Arc::new(ProbePool::new());
        pool.add_probe("http://a", 0.1, 1.0);
        pool.add_probe("http://b", 0.05, 1.0);
        let chooser = PrequalChooser::new(registry, pool);
        assert_eq!(chooser.get_next_backend(), Some("http://b".to_string()));
    }

    #[test]
    fn hot_set_prefers_minimum_rif() {
        let registry = registry_with(&["http://a", "http://b"]);
        let pool = Arc::new(ProbePool::new());
        for r in [1.0, 2.0, 3.0, 4.0] {
            pool.add_probe("http://a", 0.01, r);
        }
        for r in [1.0, 2.0, 3.0, 5.0] {
            pool.add_probe("http://b", 0.01, r);
        }
        // both hot: a's last rif 4 > median 2.5; b's last rif 5 > median 2.5
        let chooser = PrequalChooser::new(registry, pool);
        assert_eq!(chooser.get_next_backend(), Some("http://a".to_string()));
    }

    #[test]
    fn round_robin_cycles_through_healthy_set() {
        let registry = registry_with(&["http://a", "http://b"]);
        let chooser = RoundRobinChooser::new(registry);
        let first = chooser.get_next_backend().unwrap();
        let second = chooser.get_next_backend().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn least_rif_picks_lowest_tracked_rif() {
        let registry = registry_with(&["http://a", "http://b"]);
        let pool = Arc::new(ProbePool::new());
        pool.add_probe("http://a", 0.01, 5.0);
        pool.add_probe("http://b", 0.01, 1.0);
        let chooser = LeastRifChooser::new(registry, pool);
        assert_eq!(chooser.get_next_backend(), Some("http://b".to_string()));
    }

    #[test]
    fn power_of_d_never_returns_unhealthy_backend() {
        let registry = registry_with(&["http://a", "http://b", "http://c"]);
        let pool = Arc::new(ProbePool::new());
        let chooser = PowerOfDChooser::new(registry, pool, 2);
        for _ in 0..20 {
            let pick = chooser.get_next_backend().unwrap();
            assert!(["http://a", "http://b", "http://c"].contains(&pick.as_str()));
        }
    }
}
