use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;

/// One backend server in the pool.
///
/// Health is a simple flag flipped by forwarding outcomes and probes; the
/// consecutive-failure counter is reset by any success.
pub struct Backend {
    url: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl Backend {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Round-robin load balancer over a mutable backend list.
///
/// Uses `ArcSwap` for lock-free reads of the backend list on the hot path;
/// membership changes swap the whole vector. The cursor is a shared atomic,
/// so selection is approximately fair under concurrency but makes no strict
/// ordering promise across racing requests.
pub struct LoadBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    cursor: AtomicUsize,
    /// Consecutive forwarding failures before a backend is marked down.
    failure_threshold: u32,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(urls: &[String], failure_threshold: u32) -> Self {
        let backends: Vec<Arc<Backend>> =
            urls.iter().map(|url| Arc::new(Backend::new(url))).collect();
        Self {
            backends: ArcSwap::from_pointee(backends),
            cursor: AtomicUsize::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Returns the next healthy backend, advancing the shared cursor.
    ///
    /// Unhealthy backends are skipped; `None` means the whole pool is down.
    #[must_use]
    pub fn next_healthy(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.load();
        if backends.is_empty() {
            return None;
        }

        let count = backends.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;

        for offset in 0..count {
            let backend = &backends[(start + offset) % count];
            if backend.is_healthy() {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    /// Records a successful forward through `backend`.
    pub fn record_success(&self, backend: &Backend) {
        backend.consecutive_failures.store(0, Ordering::Relaxed);
        if !backend.healthy.swap(true, Ordering::Relaxed) {
            tracing::info!(url = backend.url(), "backend recovered");
        }
    }

    /// Records a forwarding failure; the backend goes down at the threshold.
    pub fn record_failure(&self, backend: &Backend) {
        let failures = backend.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold && backend.healthy.swap(false, Ordering::Relaxed) {
            tracing::warn!(
                url = backend.url(),
                failures,
                threshold = self.failure_threshold,
                "backend marked unhealthy"
            );
        }
    }

    /// All backends, healthy or not.
    #[must_use]
    pub fn all_backends(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.backends.load().iter().filter(|b| b.is_healthy()).count()
    }

    /// Adds a backend without disturbing in-flight selections.
    pub fn add_backend(&self, url: &str) {
        let backend = Arc::new(Backend::new(url));
        self.backends.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Arc::clone(&backend));
            next
        });
    }

    /// Removes a backend by URL.
    pub fn remove_backend(&self, url: &str) {
        let normalized = url.trim_end_matches('/');
        self.backends.rcu(|current| {
            current.iter().filter(|b| b.url() != normalized).cloned().collect::<Vec<_>>()
        });
    }

    /// Spawns the probe loop that resurrects downed backends.
    ///
    /// Each tick sends `GET /` to every unhealthy backend; any response at
    /// all (the server is reachable and speaking HTTP) restores it.
    pub fn start_probe_loop(
        self: &Arc<Self>,
        client: reqwest::Client,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                balancer.probe_unhealthy(&client).await;
            }
        })
    }

    /// One probe pass over the unhealthy subset.
    pub async fn probe_unhealthy(&self, client: &reqwest::Client) {
        let backends = self.backends.load_full();
        for backend in backends.iter().filter(|b| !b.is_healthy()) {
            let target = format!("{}/", backend.url());
            match client.get(&target).timeout(Duration::from_secs(5)).send().await {
                Ok(response) => {
                    tracing::debug!(
                        url = backend.url(),
                        status = response.status().as_u16(),
                        "probe succeeded"
                    );
                    self.record_success(backend);
                }
                Err(error) => {
                    tracing::debug!(url = backend.url(), %error, "probe failed");
                }
            }
        }
    }
}
