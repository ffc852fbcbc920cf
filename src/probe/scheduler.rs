//! Probe Scheduler (§4.G): decides, on a fixed tick, which healthy backends
//! to enqueue for probing this round. Probing every backend every tick does
//! not scale, so enqueue is randomized down to a rate proportional to
//! `K / RPS`, with a fairness floor that force-enqueues any backend that has
//! gone unprobed for too long.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::registry::BackendRegistry;

use super::queue::ProbeTaskQueue;

const TICK_INTERVAL: Duration = Duration::from_millis(20);
/// Width of the sliding window used to estimate requests-per-second.
const RPS_WINDOW: Duration = Duration::from_secs(1);

struct Inner {
    /// Timestamps of recently forwarded requests, used to estimate RPS.
    request_timestamps: Vec<Instant>,
    /// URLs already probed this "round"; reset once every healthy backend
    /// has been covered, so sampling is without replacement within a round.
    probed_this_round: HashSet<String>,
    last_probed: std::collections::HashMap<String, Instant>,
}

pub struct ProbeScheduler {
    registry: Arc<BackendRegistry>,
    queue: Arc<ProbeTaskQueue>,
    probe_rate_k: f64,
    min_probe_interval: Duration,
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl ProbeScheduler {
    pub fn new(
        registry: Arc<BackendRegistry>,
        queue: Arc<ProbeTaskQueue>,
        probe_rate_k: f64,
        min_probe_interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            probe_rate_k,
            min_probe_interval,
            inner: Mutex::new(Inner {
                request_timestamps: Vec::new(),
                probed_this_round: HashSet::new(),
                last_probed: std::collections::HashMap::new(),
            }),
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Records a forwarded request for the RPS estimate. Called from the
    /// forwarder's hot path; must stay cheap (push to a `Vec`, no I/O).
    pub fn record_request(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.request_timestamps.push(Instant::now());
    }

    fn estimated_rps(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Instant::now() - RPS_WINDOW;
        inner.request_timestamps.retain(|t| *t >= cutoff);
        inner.request_timestamps.len() as f64 / RPS_WINDOW.as_secs_f64()
    }

    /// Runs the tick loop until `stop()`. Each tick: estimate RPS, compute
    /// `R = min(K / RPS, 1.0)`, force-enqueue every healthy backend that has
    /// gone unprobed for longer than `MIN_PROBE_INTERVAL`, then make one
    /// Bernoulli draw against `R` to optionally enqueue one more backend
    /// drawn uniformly from the round's remaining candidates.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        while self.running.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.tick();
        }
    }

    fn tick(&self) {
        let healthy = self.registry.list_healthy();
        if healthy.is_empty() {
            return;
        }

        let rps = self.estimated_rps();
        let probability = if rps > 0.0 {
            (self.probe_rate_k / rps).min(1.0)
        } else {
            1.0
        };

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        // Reset only once every *currently* healthy backend has been
        // covered. A length comparison against `healthy.len()` is not
        // equivalent: `probed_this_round` can retain URLs that have since
        // dropped out of the healthy set (marked unhealthy or removed),
        // inflating its length past `healthy.len()` while some backends
        // that are still healthy haven't been probed this round yet.
        let fully_covered = healthy.iter().all(|b| inner.probed_this_round.contains(&b.url));
        if fully_covered {
            inner.probed_this_round.clear();
        }

        // Fairness floor first: any backend overdue by MIN_PROBE_INTERVAL is
        // force-enqueued unconditionally, independent of the R-probability
        // draw below (§4.G step 5).
        let enqueue = |inner: &mut Inner, url: &str| {
            self.queue.add(url.to_string());
            inner.probed_this_round.insert(url.to_string());
            inner.last_probed.insert(url.to_string(), now);
        };

        for backend in &healthy {
            let url = &backend.url;
            if inner.probed_this_round.contains(url) {
                continue;
            }
            let overdue = inner
                .last_probed
                .get(url)
                .map(|last| now.duration_since(*last) >= self.min_probe_interval)
                .unwrap_or(true);
            if overdue {
                enqueue(&mut inner, url);
            }
        }

        // Without-replacement candidate set for this round: healthy backends
        // not yet probed since the last reset (§4.G step 4). With
        // probability R, one candidate is drawn uniformly at random and
        // enqueued: a single Bernoulli trial per tick, not one per backend,
        // so the expected enqueue rate stays proportional to R regardless of
        // fleet size (§4.G step 3's "approximately constant absolute probe
        // rate" rationale).
        if rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0)) {
            let candidates: Vec<&str> = healthy
                .iter()
                .map(|b| b.url.as_str())
                .filter(|url| !inner.probed_this_round.contains(*url))
                .collect();
            if let Some(&picked) = candidates.choose(&mut rand::thread_rng()) {
                let picked = picked.to_string();
                enqueue(&mut inner, &picked);
            }
        }

        debug!(rps, probability, healthy = healthy.len(), "probe scheduler tick");
    }
}
