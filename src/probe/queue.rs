//! Probe Task Queue (§4.D): a deduplicated FIFO of backend URLs. Adding a
//! URL already pending is a no-op; each URL is scheduled at most once
//! concurrently. Coordination primitive only, not durable.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

struct Inner {
    pending: VecDeque<String>,
    members: HashSet<String>,
}

pub struct ProbeTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ProbeTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                members: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Inserts `url` into the set; a no-op if already pending. Signals one
    /// waiter when the URL was newly added.
    pub fn add(&self, url: impl Into<String>) {
        let url = url.into();
        let newly_added = {
            let mut inner = self.inner.lock().unwrap();
            if inner.members.insert(url.clone()) {
                inner.pending.push_back(url);
                true
            } else {
                false
            }
        };
        if newly_added {
            self.notify.notify_one();
        }
    }

    /// Blocks until non-empty, then pops one URL.
    pub async fn take(&self) -> String {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(url) = inner.pending.pop_front() {
                    inner.members.remove(&url);
                    return url;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of currently pending unique URLs.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

impl Default for ProbeTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
