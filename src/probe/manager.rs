//! Probe Manager (§4.E): drains the Probe Task Queue, issues out-of-band
//! `GET {url}{PROBE_PATH}` probes bounded to `MAX_CONCURRENT_PROBES`
//! concurrent in-flight requests, updates the Probe Pool, and feeds
//! sustained per-URL failures into the registry's circuit breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::Uri;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::http_client::{get_with_timeout, SharedClient};
use crate::registry::BackendRegistry;
use crate::wire::ProbeResponse;

use super::pool::ProbePool;
use super::queue::ProbeTaskQueue;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProbeManager {
    probe_pool: Arc<ProbePool>,
    queue: Arc<ProbeTaskQueue>,
    registry: Arc<BackendRegistry>,
    client: SharedClient,
    probe_path: String,
    max_concurrent_probes: usize,
    consecutive_failure_threshold: u32,
    failures: Mutex<HashMap<String, u32>>,
    running: AtomicBool,
    shutdown: Notify,
}

impl ProbeManager {
    pub fn new(
        probe_pool: Arc<ProbePool>,
        queue: Arc<ProbeTaskQueue>,
        registry: Arc<BackendRegistry>,
        client: SharedClient,
        probe_path: String,
        max_concurrent_probes: usize,
        consecutive_failure_threshold: u32,
    ) -> Self {
        Self {
            probe_pool,
            queue,
            registry,
            client,
            probe_path,
            max_concurrent_probes,
            consecutive_failure_threshold,
            failures: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        }
    }

    /// Signals the dispatch loop to exit. Wakes a `run()` task parked on an
    /// empty queue so it actually observes the flag instead of blocking
    /// forever on `queue.take()` (§5: "probe workers are cooperative and
    /// terminate when `stop` is signaled").
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    /// Drains the queue until `stop()`, dispatching each taken URL as its
    /// own probe task bounded by a semaphore of `max_concurrent_probes`
    /// permits, so draining the queue itself never blocks on a slow probe.
    /// Races `queue.take()` against the shutdown notification so the loop
    /// can exit even while parked on an empty queue.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_probes));
        while self.running.load(Ordering::Relaxed) {
            let url = tokio::select! {
                url = self.queue.take() => url,
                _ = self.shutdown.notified() => break,
            };
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let this = self.clone();
            tokio::spawn(async move {
                this.probe_one(&url).await;
                drop(permit);
            });
        }
    }

    async fn probe_one(&self, url: &str) {
        let target = format!("{url}{}", self.probe_path);
        let uri: Uri = match target.parse() {
            Ok(u) => u,
            Err(_) => {
                self.handle_failure(url);
                return;
            }
        };

        match get_with_timeout(&self.client, uri, PROBE_TIMEOUT).await {
            Ok((response, body)) if response.status().is_success() => {
                match serde_json::from_slice::<ProbeResponse>(&body) {
                    Ok(parsed) => {
                        self.probe_pool.add_probe(
                            url,
                            parsed.rif_avg_latency,
                            parsed.in_flight_requests,
                        );
                        debug!(url, latency = parsed.rif_avg_latency, rif = parsed.in_flight_requests, "probe succeeded");
                        self.reset_failures(url);
                    }
                    Err(e) => {
                        warn!(url, error = %e, "probe response parse error");
                        self.handle_failure(url);
                    }
                }
            }
            Ok((response, _)) => {
                warn!(url, status = response.status().as_u16(), "probe returned non-2xx");
                self.handle_failure(url);
            }
            Err(e) => {
                warn!(url, error = %e, "probe request failed");
                self.handle_failure(url);
            }
        }
    }

    fn reset_failures(&self, url: &str) {
        self.failures.lock().unwrap().remove(url);
    }

    fn handle_failure(&self, url: &str) {
        let count = {
            let mut failures = self.failures.lock().unwrap();
            let count = failures.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(url, consecutive_failures = count, "probe failure recorded");
        if count >= self.consecutive_failure_threshold {
            self.registry.mark_unhealthy(url);
            info!(url, "backend marked unhealthy after consecutive probe failures");
        }
    }
}
