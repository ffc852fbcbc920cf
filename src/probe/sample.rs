//! Per-backend sliding window of latency/RIF samples, and the hot/cold
//! temperature derived from it (§3).

use std::collections::VecDeque;
use std::time::Instant;

/// Window capacity per backend (§3: "Sliding window capped at 1000 entries").
pub const WINDOW_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    Hot,
    Cold,
}

#[derive(Debug)]
pub struct ProbeSample {
    latencies: VecDeque<f64>,
    rif_values: VecDeque<f64>,
    current_latency: f64,
    last_rif: f64,
    pub last_update: Instant,
}

impl ProbeSample {
    fn empty() -> Self {
        Self {
            latencies: VecDeque::with_capacity(WINDOW_CAPACITY),
            rif_values: VecDeque::with_capacity(WINDOW_CAPACITY),
            current_latency: 0.0,
            last_rif: 0.0,
            last_update: Instant::now(),
        }
    }

    pub fn new(latency: f64, rif: f64) -> Self {
        let mut sample = Self::empty();
        sample.record(latency, rif);
        sample
    }

    pub fn record(&mut self, latency: f64, rif: f64) {
        if self.latencies.len() == WINDOW_CAPACITY {
            self.latencies.pop_front();
        }
        if self.rif_values.len() == WINDOW_CAPACITY {
            self.rif_values.pop_front();
        }
        self.latencies.push_back(latency);
        self.rif_values.push_back(rif);
        self.last_rif = rif;
        self.last_update = Instant::now();
        self.current_latency = self.latencies.iter().sum::<f64>() / self.latencies.len() as f64;
    }

    /// Mean of the latency window (§8 invariant 4).
    pub fn current_latency(&self) -> f64 {
        self.current_latency
    }

    /// Hot iff the most recent RIF strictly exceeds the median of the RIF
    /// window; a backend with no samples is cold (§3, §8 invariant 5).
    pub fn temperature(&self) -> Temperature {
        if self.rif_values.is_empty() {
            return Temperature::Cold;
        }
        let median = median_of(&self.rif_values);
        if self.last_rif > median {
            Temperature::Hot
        } else {
            Temperature::Cold
        }
    }

    pub fn last_rif(&self) -> f64 {
        self.last_rif
    }
}

fn median_of(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_latency_is_mean_of_window() {
        let mut sample = ProbeSample::new(0.1, 1.0);
        sample.record(0.3, 2.0);
        assert!((sample.current_latency() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn no_samples_is_cold() {
        let empty = ProbeSample::empty();
        assert_eq!(empty.temperature(), Temperature::Cold);
    }

    #[test]
    fn hot_when_last_rif_above_median() {
        let mut sample = ProbeSample::new(0.1, 1.0);
        sample.record(0.1, 2.0);
        sample.record(0.1, 3.0);
        sample.record(0.1, 4.0); // median of [1,2,3,4] = 2.5, last = 4 > 2.5
        assert_eq!(sample.temperature(), Temperature::Hot);
    }

    #[test]
    fn cold_when_last_rif_at_or_below_median() {
        let mut sample = ProbeSample::new(0.1, 4.0);
        sample.record(0.1, 1.0);
        sample.record(0.1, 2.0);
        sample.record(0.1, 1.0); // median of [4,1,2,1] sorted [1,1,2,4] = 1.5, last=1 <= 1.5
        assert_eq!(sample.temperature(), Temperature::Cold);
    }

    #[test]
    fn window_is_capped() {
        let mut sample = ProbeSample::new(0.0, 0.0);
        for i in 0..(WINDOW_CAPACITY + 10) {
            sample.record(i as f64, i as f64);
        }
        assert_eq!(sample.latencies.len(), WINDOW_CAPACITY);
        assert_eq!(sample.rif_values.len(), WINDOW_CAPACITY);
    }
}
