//! Backend-side Metrics Manager (§4.I): in-flight counter plus a
//! RIF-bucketed latency histogram, exposed to the proxy via `/probe`.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Per-bin cap on retained latency samples (§3).
const BIN_CAPACITY: usize = 1000;

struct Histogram {
    /// Strictly-increasing bin upper bounds. Empty means "bucket by exact
    /// RIF" (§3: "if no bins are configured, the exact RIF is the key").
    bin_bounds: Vec<f64>,
    bins: BTreeMap<u64, VecDeque<f64>>,
    all_latencies: VecDeque<f64>,
}

impl Histogram {
    fn new(bin_bounds: Vec<f64>) -> Self {
        Self { bin_bounds, bins: BTreeMap::new(), all_latencies: VecDeque::with_capacity(BIN_CAPACITY) }
    }

    /// Bin key for a given RIF: the smallest configured bound `>= rif`,
    /// clamped to the largest bound when `rif` exceeds every bound; the
    /// exact RIF (as bit pattern) when no bounds are configured.
    fn bin_key(&self, rif: f64) -> u64 {
        if self.bin_bounds.is_empty() {
            return rif.to_bits();
        }
        self.bin_bounds
            .iter()
            .find(|b| **b >= rif)
            .copied()
            .unwrap_or(*self.bin_bounds.last().unwrap())
            .to_bits()
    }

    fn record(&mut self, rif: f64, latency: f64) {
        let key = self.bin_key(rif);
        let bin = self.bins.entry(key).or_insert_with(|| VecDeque::with_capacity(BIN_CAPACITY));
        if bin.len() == BIN_CAPACITY {
            bin.pop_front();
        }
        bin.push_back(latency);

        if self.all_latencies.len() == BIN_CAPACITY {
            self.all_latencies.pop_front();
        }
        self.all_latencies.push_back(latency);
    }

    /// Median at `rif`'s bin; if that bin is empty, linear interpolation
    /// across the nearest populated neighboring bin keys; if only one side
    /// is populated, that side's median; if none, 0 (§3).
    fn rif_avg_latency(&self, rif: f64) -> f64 {
        let key = self.bin_key(rif);
        if let Some(bin) = self.bins.get(&key) {
            if !bin.is_empty() {
                return median(bin);
            }
        }

        let lower = self.bins.range(..key).next_back().filter(|(_, b)| !b.is_empty());
        let upper = self.bins.range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
            .find(|(_, b)| !b.is_empty());

        match (lower, upper) {
            (Some((_, l)), Some((_, u))) => (median(l) + median(u)) / 2.0,
            (Some((_, l)), None) => median(l),
            (None, Some((_, u))) => median(u),
            (None, None) => 0.0,
        }
    }

    fn overall_avg_latency(&self) -> f64 {
        if self.all_latencies.is_empty() {
            return 0.0;
        }
        self.all_latencies.iter().sum::<f64>() / self.all_latencies.len() as f64
    }
}

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Pure accumulator: no state transitions beyond counters and histograms.
pub struct MetricsManager {
    in_flight: AtomicI64,
    histogram: Mutex<Histogram>,
}

impl MetricsManager {
    pub fn new(bin_bounds: Vec<f64>) -> Self {
        Self { in_flight: AtomicI64::new(0), histogram: Mutex::new(Histogram::new(bin_bounds)) }
    }

    pub fn in_flight_requests(&self) -> f64 {
        self.in_flight.load(Ordering::Acquire) as f64
    }

    /// Marks request entry and returns a guard that decrements on drop,
    /// recording the observed latency bucketed by the RIF seen at entry.
    pub fn track_request(self: &std::sync::Arc<Self>) -> RequestGuard {
        let rif_at_entry = self.in_flight.fetch_add(1, Ordering::AcqRel) as f64 + 1.0;
        RequestGuard {
            manager: self.clone(),
            rif_at_entry,
            started: std::time::Instant::now(),
        }
    }

    /// `rif_avg_latency` at the current RIF, with the interpolation
    /// fallback described in §3; `overall_avg_latency` over all samples.
    pub fn snapshot(&self) -> (f64, f64, f64) {
        let histogram = self.histogram.lock().unwrap();
        let current_rif = self.in_flight_requests();
        (current_rif, histogram.rif_avg_latency(current_rif), histogram.overall_avg_latency())
    }
}

pub struct RequestGuard {
    manager: std::sync::Arc<MetricsManager>,
    rif_at_entry: f64,
    started: std::time::Instant,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.in_flight.fetch_sub(1, Ordering::AcqRel);
        let latency = self.started.elapsed().as_secs_f64();
        self.manager.histogram.lock().unwrap().record(self.rif_at_entry, latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn in_flight_increments_and_decrements_across_guard_lifetime() {
        let manager = Arc::new(MetricsManager::new(vec![]));
        assert_eq!(manager.in_flight_requests(), 0.0);
        let guard = manager.track_request();
        assert_eq!(manager.in_flight_requests(), 1.0);
        drop(guard);
        assert_eq!(manager.in_flight_requests(), 0.0);
    }

    #[test]
    fn median_is_exact_for_populated_bin() {
        let manager = Arc::new(MetricsManager::new(vec![]));
        {
            let g1 = manager.track_request();
            drop(g1);
        }
        let (_, rif_latency, overall) = manager.snapshot();
        assert!(rif_latency >= 0.0);
        assert!(overall >= 0.0);
    }

    #[test]
    fn empty_histogram_returns_zero() {
        let manager = MetricsManager::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(manager.snapshot().1, 0.0);
        assert_eq!(manager.snapshot().2, 0.0);
    }

    #[test]
    fn bin_key_clamps_rif_above_largest_bound() {
        let histogram = Histogram::new(vec![1.0, 5.0, 10.0]);
        assert_eq!(histogram.bin_key(100.0), 10.0f64.to_bits());
        assert_eq!(histogram.bin_key(0.5), 1.0f64.to_bits());
        assert_eq!(histogram.bin_key(5.0), 5.0f64.to_bits());
    }

    #[test]
    fn interpolation_fallback_averages_neighboring_populated_bins() {
        let mut histogram = Histogram::new(vec![1.0, 5.0, 10.0]);
        histogram.record(1.0, 0.10); // bin 1.0
        histogram.record(10.0, 0.30); // bin 10.0
        // bin 5.0 is empty: interpolate between 0.10 and 0.30
        let value = histogram.rif_avg_latency(5.0);
        assert!((value - 0.20).abs() < 1e-9);
    }
}
