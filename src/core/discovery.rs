//! Client-side lookup of a running server instance.
//!
//! Ports are probed in ascending batches with every probe in a batch in flight
//! at once. A single wall-clock deadline bounds the whole search, so a probe
//! that never answers cannot hold discovery past `timeout`.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_RANGE_START: u16 = 9090;
pub const DEFAULT_RANGE_END: u16 = 9100;
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// `Some(true)` means a live instance answered. `None` and `Some(false)` are both "not here".
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn check(&self, port: u16) -> Option<bool>;
}

/// GETs `/health` and accepts only a body naming the expected app.
pub struct HttpLivenessCheck {
    client: reqwest::Client,
    host: String,
    app_name: String,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    app_name: Option<String>,
}

impl HttpLivenessCheck {
    pub fn new(host: impl Into<String>, app_name: impl Into<String>, per_probe: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(per_probe)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, host: host.into(), app_name: app_name.into() })
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessCheck {
    async fn check(&self, port: u16) -> Option<bool> {
        let url = format!("http://{}:{}/health", self.host, port);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return Some(false);
        }
        let body: HealthBody = resp.json().await.ok()?;
        Some(body.app_name.as_deref() == Some(self.app_name.as_str()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    port: u16,
}

/// Last known good port, optionally mirrored to a small JSON file.
#[derive(Debug, Default)]
pub struct PortCache {
    port: Mutex<Option<u16>>,
    file: Option<PathBuf>,
}

impl PortCache {
    pub fn in_memory(port: Option<u16>) -> Self {
        Self { port: Mutex::new(port), file: None }
    }

    /// A missing or unreadable file just means an empty cache.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let port = std::fs::read(&file)
            .ok()
            .and_then(|raw| serde_json::from_slice::<CacheFile>(&raw).ok())
            .map(|c| c.port);
        Self { port: Mutex::new(port), file: Some(file) }
    }

    pub fn get(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn set(&self, port: u16) {
        *self.port.lock() = Some(port);
        if let Some(file) = &self.file {
            if let Some(parent) = file.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(raw) = serde_json::to_vec(&CacheFile { port }) {
                if let Err(e) = std::fs::write(file, raw) {
                    debug!(file = %file.display(), error = %e, "could not persist port cache");
                }
            }
        }
    }

    pub fn invalidate(&self) {
        *self.port.lock() = None;
        if let Some(file) = &self.file {
            let _ = std::fs::remove_file(file);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub range_start: u16,
    pub range_end: u16,
    pub force_scan: bool,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            range_start: DEFAULT_RANGE_START,
            range_end: DEFAULT_RANGE_END,
            force_scan: false,
            timeout: Duration::from_millis(3000),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Called after each finished batch with the number of ports scanned so far.
pub type ProgressFn<'a> = &'a (dyn Fn(usize) + Send + Sync);

pub async fn discover(
    check: &dyn LivenessCheck,
    cache: &PortCache,
    opts: &DiscoveryOptions,
    on_progress: Option<ProgressFn<'_>>,
) -> Option<u16> {
    let deadline = Instant::now() + opts.timeout;

    if !opts.force_scan {
        if let Some(port) = cache.get() {
            let alive = tokio::time::timeout_at(deadline, check.check(port)).await;
            if let Ok(Some(true)) = alive {
                debug!(port, "cached port is live");
                return Some(port);
            }
            debug!(port, "cached port did not answer, scanning");
            cache.invalidate();
        }
    }

    let found = match tokio::time::timeout_at(deadline, scan(check, opts, on_progress)).await {
        Ok(found) => found,
        Err(_) => {
            info!(timeout_ms = opts.timeout.as_millis() as u64, "port discovery timed out");
            None
        }
    };

    if let Some(port) = found {
        info!(port, "found live instance");
        cache.set(port);
    }
    found
}

async fn scan(check: &dyn LivenessCheck, opts: &DiscoveryOptions, on_progress: Option<ProgressFn<'_>>) -> Option<u16> {
    if opts.range_start > opts.range_end {
        return None;
    }
    let ports: Vec<u16> = (opts.range_start..=opts.range_end).collect();
    let mut scanned = 0;

    for batch in ports.chunks(opts.batch_size.max(1)) {
        let found = probe_batch(check, batch).await;
        scanned += batch.len();
        if let Some(cb) = on_progress {
            cb(scanned);
        }
        if found.is_some() {
            return found;
        }
    }
    None
}

/// Lowest live port in the batch. Returns as soon as every lower port has answered
/// rather than waiting on stragglers above it.
async fn probe_batch(check: &dyn LivenessCheck, batch: &[u16]) -> Option<u16> {
    let mut pending: FuturesUnordered<_> = batch
        .iter()
        .map(|&port| async move { (port, check.check(port).await == Some(true)) })
        .collect();
    let mut answered: BTreeMap<u16, bool> = BTreeMap::new();

    while let Some((port, alive)) = pending.next().await {
        answered.insert(port, alive);
        // walk the batch in order until the first port still outstanding
        for p in batch {
            match answered.get(p) {
                Some(true) => return Some(*p),
                Some(false) => continue,
                None => break,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Stub {
        live: HashSet<u16>,
        hang: HashSet<u16>,
        delay: BTreeMap<u16, Duration>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn live(ports: &[u16]) -> Self {
            Self {
                live: ports.iter().copied().collect(),
                hang: HashSet::new(),
                delay: BTreeMap::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LivenessCheck for Stub {
        async fn check(&self, port: u16) -> Option<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&port) {
                std::future::pending::<()>().await;
            }
            if let Some(d) = self.delay.get(&port) {
                tokio::time::sleep(*d).await;
            }
            if self.live.contains(&port) {
                Some(true)
            } else {
                None
            }
        }
    }

    fn opts(timeout_ms: u64) -> DiscoveryOptions {
        DiscoveryOptions { timeout: Duration::from_millis(timeout_ms), ..DiscoveryOptions::default() }
    }

    #[tokio::test]
    async fn finds_the_only_live_port() {
        let stub = Stub::live(&[9097]);
        let cache = PortCache::in_memory(None);
        assert_eq!(discover(&stub, &cache, &opts(1000), None).await, Some(9097));
        assert_eq!(cache.get(), Some(9097));
    }

    #[tokio::test]
    async fn nothing_live_is_none() {
        let stub = Stub::live(&[]);
        let cache = PortCache::in_memory(None);
        assert_eq!(discover(&stub, &cache, &opts(1000), None).await, None);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 11);
        assert_eq!(cache.get(), None);
    }

    #[tokio::test]
    async fn hanging_probes_are_cut_off_by_the_deadline() {
        let mut stub = Stub::live(&[9095]);
        stub.hang = (9090..=9100).collect();
        let cache = PortCache::in_memory(None);

        let started = std::time::Instant::now();
        assert_eq!(discover(&stub, &cache, &opts(200), None).await, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(190), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "returned too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn lowest_live_port_wins_even_if_slower() {
        let mut stub = Stub::live(&[9091, 9093]);
        stub.delay.insert(9091, Duration::from_millis(50));
        let cache = PortCache::in_memory(None);
        assert_eq!(discover(&stub, &cache, &opts(1000), None).await, Some(9091));
    }

    #[tokio::test]
    async fn live_port_returns_without_waiting_on_higher_stragglers() {
        let mut stub = Stub::live(&[9090]);
        stub.hang.insert(9092);
        let cache = PortCache::in_memory(None);
        let started = std::time::Instant::now();
        assert_eq!(discover(&stub, &cache, &opts(2000), None).await, Some(9090));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn cached_port_is_tried_first() {
        let stub = Stub::live(&[9099]);
        let cache = PortCache::in_memory(Some(9099));
        assert_eq!(discover(&stub, &cache, &opts(1000), None).await, Some(9099));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_is_invalidated_then_scanned() {
        let stub = Stub::live(&[9092]);
        let cache = PortCache::in_memory(Some(9099));
        assert_eq!(discover(&stub, &cache, &opts(1000), None).await, Some(9092));
        assert_eq!(cache.get(), Some(9092));
    }

    #[tokio::test]
    async fn force_scan_skips_the_cache() {
        let stub = Stub::live(&[9090, 9099]);
        let cache = PortCache::in_memory(Some(9099));
        let o = DiscoveryOptions { force_scan: true, ..opts(1000) };
        assert_eq!(discover(&stub, &cache, &o, None).await, Some(9090));
    }

    #[tokio::test]
    async fn progress_reports_cumulative_counts_per_batch() {
        let stub = Stub::live(&[]);
        let cache = PortCache::in_memory(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = move |n: usize| sink.lock().push(n);

        discover(&stub, &cache, &opts(1000), Some(&cb)).await;
        assert_eq!(*seen.lock(), vec![5, 10, 11]);
    }

    #[test]
    fn cache_file_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested/port.json");

        PortCache::load(&file).set(9094);
        assert_eq!(PortCache::load(&file).get(), Some(9094));

        PortCache::load(&file).invalidate();
        assert_eq!(PortCache::load(&file).get(), None);
    }
}
