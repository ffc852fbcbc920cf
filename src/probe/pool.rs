//! Probe Pool (§4.C): windowed per-backend latency/RIF samples, queried in
//! batches to minimize lock acquisitions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::sample::{ProbeSample, Temperature};

/// At most this many backends are tracked at once; eviction is FIFO by
/// insertion order, not by last-activity (§3, §9 design note).
pub const MAX_BACKENDS: usize = 16;

pub struct ProbePool {
    inner: Mutex<Inner>,
}

struct Inner {
    samples: HashMap<String, ProbeSample>,
    insertion_order: VecDeque<String>,
}

impl ProbePool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    /// Appends to both windows for `url`, recomputing the derived fields
    /// under the same lock acquisition so readers see a consistent
    /// `(current_latency, current_rif, temperature)` snapshot per URL.
    pub fn add_probe(&self, url: &str, latency: f64, rif: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sample) = inner.samples.get_mut(url) {
            sample.record(latency, rif);
            return;
        }

        if inner.samples.len() >= MAX_BACKENDS {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                inner.samples.remove(&oldest);
            }
        }
        inner.samples.insert(url.to_string(), ProbeSample::new(latency, rif));
        inner.insertion_order.push_back(url.to_string());
    }

    pub fn current_latency(&self, url: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.samples.get(url).map(|s| s.current_latency())
    }

    pub fn current_rif(&self, url: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.samples.get(url).map(|s| s.last_rif())
    }

    pub fn temperature(&self, url: &str) -> Temperature {
        let inner = self.inner.lock().unwrap();
        inner
            .samples
            .get(url)
            .map(|s| s.temperature())
            .unwrap_or(Temperature::Cold)
    }

    /// Batch query: one per URL, single lock acquisition.
    pub fn current_latencies(&self, urls: &[String]) -> Vec<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        urls.iter()
            .map(|u| inner.samples.get(u).map(|s| s.current_latency()))
            .collect()
    }

    pub fn current_rifs(&self, urls: &[String]) -> Vec<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        urls.iter()
            .map(|u| inner.samples.get(u).map(|s| s.last_rif()))
            .collect()
    }

    pub fn current_temperatures(&self, urls: &[String]) -> Vec<Temperature> {
        let inner = self.inner.lock().unwrap();
        urls.iter()
            .map(|u| {
                inner
                    .samples
                    .get(u)
                    .map(|s| s.temperature())
                    .unwrap_or(Temperature::Cold)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProbePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read_back() {
        let pool = ProbePool::new();
        pool.add_probe("http://a", 0.1, 2.0);
        assert_eq!(pool.current_latency("http://a"), Some(0.1));
        assert_eq!(pool.current_rif("http://a"), Some(2.0));
    }

    #[test]
    fn unknown_backend_has_no_sample() {
        let pool = ProbePool::new();
        assert_eq!(pool.current_latency("http://nope"), None);
        assert_eq!(pool.temperature("http://nope"), Temperature::Cold);
    }

    #[test]
    fn evicts_oldest_inserted_url_when_over_capacity() {
        let pool = ProbePool::new();
        for i in 0..MAX_BACKENDS {
            pool.add_probe(&format!("http://b{i}"), 0.1, 1.0);
        }
        // touch b1 repeatedly - activity should NOT save it from eviction
        for _ in 0..5 {
            pool.add_probe("http://b1", 0.2, 1.0);
        }
        pool.add_probe("http://new", 0.1, 1.0);

        assert_eq!(pool.len(), MAX_BACKENDS);
        assert_eq!(pool.current_latency("http://b0"), None, "oldest inserted should be evicted");
        assert!(pool.current_latency("http://b1").is_some(), "activity doesn't exempt from FIFO eviction");
    }

    #[test]
    fn batch_queries_match_single_queries() {
        let pool = ProbePool::new();
        pool.add_probe("http://a", 0.1, 1.0);
        pool.add_probe("http://b", 0.2, 2.0);
        let urls = vec!["http://a".to_string(), "http://b".to_string(), "http://missing".to_string()];
        let latencies = pool.current_latencies(&urls);
        assert_eq!(latencies, vec![Some(0.1), Some(0.2), None]);
    }
}
