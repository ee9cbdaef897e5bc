//! The cache service
//!
//! [`CacheService`] is the one object the HTTP layer talks to. It owns the
//! index, the running counters and the pending statistics behind a single
//! lock, and coordinates the content store, persistence and eviction.

use ctcache_content_store::{CacheHash, ContentStorage, FileContentStore};
use futures::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::charts::ChartKind;
use crate::clock::{Clock, SystemClock};
use crate::config::{MaintenanceMode, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::eviction::{EvictionEngine, RetentionPolicy};
use crate::index::{CacheEntry, CacheIndex};
use crate::persistence::PersistenceManager;
use crate::stats::{self, Info, RunningCounters, StatsSnapshot, StorageSizes};

/// Timing and placement settings of the service
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Seconds between index saves
    pub save_interval: f64,
    /// Seconds between statistics flushes
    pub stats_save_interval: f64,
    /// Seconds between cleanup cycles
    pub cleanup_interval: f64,
    pub maintenance_mode: MaintenanceMode,
    pub static_dir: PathBuf,
}

impl CacheSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            save_interval: config.save_interval as f64,
            stats_save_interval: config.stats_save_interval as f64,
            cleanup_interval: config.cleanup_interval as f64,
            maintenance_mode: config.maintenance_mode,
            static_dir: config.static_dir.clone(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// One kind of periodic maintenance work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    FlushStats,
    Save,
    Cleanup,
}

impl MaintenanceTask {
    /// All tasks, in the order a maintenance pass runs them
    pub const ALL: [MaintenanceTask; 3] = [MaintenanceTask::FlushStats, MaintenanceTask::Save, MaintenanceTask::Cleanup];
}

#[derive(Debug)]
struct CacheState {
    index: CacheIndex,
    counters: RunningCounters,
    pending_stats: Vec<StatsSnapshot>,
}

/// Coordinates every cache operation
#[derive(Debug)]
pub struct CacheService {
    state: Mutex<CacheState>,
    store: Arc<dyn ContentStorage>,
    persistence: PersistenceManager,
    eviction: EvictionEngine,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl CacheService {
    /// Create the service, restoring the index from the last snapshot
    pub async fn new(
        store: Arc<dyn ContentStorage>,
        persistence: PersistenceManager,
        eviction: EvictionEngine,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        let index = persistence.load().await;
        let counters = RunningCounters::new(clock.now());
        Self {
            state: Mutex::new(CacheState {
                index,
                counters,
                pending_stats: Vec::new(),
            }),
            store,
            persistence,
            eviction,
            clock,
            settings,
        }
    }

    /// Create the service with on-disk blobs and the wall clock
    pub async fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        let store = FileContentStore::open(&config.cache_dir).await?;
        let persistence = PersistenceManager::new(&config.save_path)
            .with_stats_path(config.stats_path.clone())
            .with_chart_path(config.chart_path.clone());
        let eviction = EvictionEngine::new(RetentionPolicy::default(), config.max_cache_size);

        Ok(Self::new(
            Arc::new(store),
            persistence,
            eviction,
            Arc::new(SystemClock),
            CacheSettings::from_config(config),
        )
        .await)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Whether `hash` is cached; counts as a hit or a miss
    pub async fn is_cached(&self, hash: &str) -> ServerResult<bool> {
        let hash = CacheHash::parse(hash)?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let cached = record_lookup(&mut state, &hash, now).is_some();
        debug!(hash = %hash, cached, "Checked cache");

        self.maintain_inline(&mut state, now).await;
        Ok(cached)
    }

    /// Bytes cached for `hash`; counts as a hit or a miss.
    ///
    /// The blob is read after the lock is released. A blob evicted in
    /// between is reported as not found.
    pub async fn fetch(&self, hash: &str) -> ServerResult<Vec<u8>> {
        let hash = CacheHash::parse(hash)?;
        {
            let mut state = self.state.lock().await;
            let now = self.clock.now();

            let entry = record_lookup(&mut state, &hash, now);
            self.maintain_inline(&mut state, now).await;
            if entry.is_none() {
                debug!(hash = %hash, "Cache miss");
                return Err(ServerError::NotFound(format!("Cache entry {}", hash)));
            }
        }

        let content = self.store.get(hash.as_str()).await?;
        debug!(hash = %hash, bytes = content.len(), "Cache hit");
        Ok(content)
    }

    /// Stores `content` under `hash`, creating or touching its entry.
    ///
    /// Not counted as a hit or a miss. If the blob cannot be written the
    /// index is left as it was.
    pub async fn store(&self, hash: &str, content: &[u8]) -> ServerResult<CacheEntry> {
        let hash = CacheHash::parse(hash)?;
        let mut state = self.state.lock().await;

        self.store.put(hash.as_str(), content).await?;
        let now = self.clock.now();
        let entry = state.index.insert_or_touch(hash.clone(), now);
        debug!(hash = %hash, bytes = content.len(), hits = entry.hits, "Stored cache entry");

        self.maintain_inline(&mut state, now).await;
        Ok(entry)
    }

    /// Removes every blob and index entry, then saves the empty index
    pub async fn purge(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;

        let mut ids: Vec<String> = state.index.all().map(|(hash, _)| hash.to_string()).collect();
        match self.store.list().await {
            Ok(listed) => ids.extend(listed.into_iter().filter(|id| !state.index.contains_id(id))),
            Err(err) => warn!(error = %err, "Failed to list content store during purge"),
        }
        for id in &ids {
            if let Err(err) = self.store.remove(id).await {
                warn!(id = %id, error = %err, "Failed to remove blob during purge");
            }
        }
        state.index.clear();

        let now = self.clock.now();
        self.save_locked(&mut state, now).await;
        info!(removed = ids.len(), "Purged cache");
        Ok(())
    }

    /// Current statistics
    pub async fn stats(&self) -> StatsSnapshot {
        let state = self.state.lock().await;
        self.snapshot_locked(&state, self.clock.now()).await
    }

    pub fn info(&self) -> Info {
        Info {
            static_path: self.settings.static_dir.display().to_string(),
            save_path: self.persistence.save_path().display().to_string(),
            cache_path: self
                .store
                .location()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        }
    }

    /// Copy of the running counters
    pub async fn counters(&self) -> RunningCounters {
        self.state.lock().await.counters.clone()
    }

    pub async fn cached_count(&self) -> usize {
        self.state.lock().await.index.count()
    }

    pub async fn hit_rate(&self) -> Option<f64> {
        stats::hit_rate(&self.state.lock().await.counters)
    }

    pub async fn miss_rate(&self) -> Option<f64> {
        stats::miss_rate(&self.state.lock().await.counters)
    }

    /// Entry for `hash` without recording a hit
    pub async fn entry(&self, hash: &str) -> ServerResult<Option<CacheEntry>> {
        let hash = CacheHash::parse(hash)?;
        Ok(self.state.lock().await.index.get(&hash).copied())
    }

    /// Renders `kind` as SVG
    pub async fn chart(&self, kind: ChartKind) -> String {
        let state = self.state.lock().await;
        kind.render(&state.index, self.clock.now())
    }

    /// Body of `/stats/ctcache.json`
    pub fn saved_stats_stream(&self) -> impl Stream<Item = std::io::Result<String>> + Send + 'static {
        self.persistence.saved_stats_stream()
    }

    /// Runs every task whose interval has elapsed, in order, and returns them
    pub async fn run_due_maintenance(&self) -> Vec<MaintenanceTask> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.maintain_locked(&mut state, now).await
    }

    /// Runs `task` now, regardless of its interval
    pub async fn run_maintenance(&self, task: MaintenanceTask) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.run_task_locked(&mut state, task, now).await;
    }

    /// Saves the index now
    pub async fn save_now(&self) -> ServerResult<u64> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let bytes = self.persistence.save(&state.index).await?;
        state.counters.save_time = now;
        Ok(bytes)
    }

    async fn maintain_inline(&self, state: &mut CacheState, now: f64) {
        if self.settings.maintenance_mode == MaintenanceMode::Inline {
            self.maintain_locked(state, now).await;
        }
    }

    async fn maintain_locked(&self, state: &mut CacheState, now: f64) -> Vec<MaintenanceTask> {
        let mut ran = Vec::new();
        for task in MaintenanceTask::ALL {
            let (last, interval) = match task {
                MaintenanceTask::FlushStats => (state.counters.stats_save_time, self.settings.stats_save_interval),
                MaintenanceTask::Save => (state.counters.save_time, self.settings.save_interval),
                MaintenanceTask::Cleanup => (state.counters.cleanup_time, self.settings.cleanup_interval),
            };
            if now - last > interval {
                self.run_task_locked(state, task, now).await;
                ran.push(task);
            }
        }
        ran
    }

    async fn run_task_locked(&self, state: &mut CacheState, task: MaintenanceTask, now: f64) {
        match task {
            MaintenanceTask::FlushStats => {
                if let Err(err) = self.persistence.flush_stats(&mut state.pending_stats, now).await {
                    warn!(error = %err, pending = state.pending_stats.len(), "Failed to save statistics");
                }
                state.counters.stats_save_time = now;
            }
            MaintenanceTask::Save => self.save_locked(state, now).await,
            MaintenanceTask::Cleanup => self.cleanup_locked(state, now).await,
        }
    }

    async fn save_locked(&self, state: &mut CacheState, now: f64) {
        if let Err(err) = self.persistence.save(&state.index).await {
            warn!(error = %err, "Failed to save cache index");
        }
        state.counters.save_time = now;
    }

    async fn cleanup_locked(&self, state: &mut CacheState, now: f64) {
        let snapshot = self.snapshot_locked(state, now).await.with_timestamp(now);
        state.pending_stats.push(snapshot);

        let before = state.index.count();
        let report = self.eviction.run(&mut state.index, self.store.as_ref(), now).await;
        let removed = before.saturating_sub(state.index.count());
        state.counters.cleaned += removed as u64;

        let svg = ChartKind::HitsHistogram.render(&state.index, now);
        if let Err(err) = self.persistence.save_chart(&svg, now).await {
            warn!(error = %err, "Failed to save hits chart");
        }

        state.counters.cleanup_time = now;
        info!(
            by_metric = report.by_metric,
            invalid_blobs = report.invalid_blobs,
            by_size = report.by_size,
            remaining = state.index.count(),
            "Cleanup finished"
        );
    }

    async fn snapshot_locked(&self, state: &CacheState, now: f64) -> StatsSnapshot {
        let saved_cache_size = match self.store.total_size().await {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "Failed to measure content store");
                0
            }
        };
        let sizes = StorageSizes {
            saved_size_bytes: self.persistence.save_file_size().await,
            saved_cache_size,
        };
        StatsSnapshot::collect(&state.index, &state.counters, sizes, now)
    }
}

fn record_lookup(state: &mut CacheState, hash: &CacheHash, now: f64) -> Option<CacheEntry> {
    let entry = state.index.lookup_and_touch(hash, now);
    if entry.is_some() {
        state.counters.hits += 1;
    } else {
        state.counters.misses += 1;
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SECONDS_PER_DAY};
    use ctcache_content_store::InMemoryContentStore;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const START: f64 = 1_700_000_000.0;

    struct Fixture {
        service: CacheService,
        store: InMemoryContentStore,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    async fn fixture(mode: MaintenanceMode, max_cache_size: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = InMemoryContentStore::new();
        let clock = Arc::new(ManualClock::new(START));
        let settings = CacheSettings {
            save_interval: 600.0,
            stats_save_interval: 3600.0,
            cleanup_interval: 60.0,
            maintenance_mode: mode,
            static_dir: dir.path().join("static"),
        };
        let service = CacheService::new(
            Arc::new(store.clone()),
            PersistenceManager::new(dir.path().join("ctcache.json.gz")),
            EvictionEngine::new(RetentionPolicy::default(), max_cache_size),
            clock.clone(),
            settings,
        )
        .await;
        Fixture { service, store, clock, _dir: dir }
    }

    fn hash(c: char) -> String {
        c.to_string().repeat(40)
    }

    #[tokio::test]
    async fn test_store_then_fetch() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        f.service.store(&hash('a'), b"warning: foo").await.unwrap();

        assert_eq!(f.service.fetch(&hash('a')).await.unwrap(), b"warning: foo");
        let counters = f.service.counters().await;
        assert_eq!((counters.hits, counters.misses), (1, 0));
    }

    #[tokio::test]
    async fn test_fetch_miss_creates_no_entry() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;

        assert!(matches!(f.service.fetch(&hash('b')).await, Err(ServerError::NotFound(_))));
        assert_eq!(f.service.cached_count().await, 0);
        assert_eq!(f.service.counters().await.misses, 1);
    }

    #[tokio::test]
    async fn test_hits_after_repeated_fetches() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        f.service.store(&hash('c'), b"x").await.unwrap();

        let mut last_access = 0.0;
        for n in 1..=4u64 {
            f.clock.advance(1.0);
            f.service.fetch(&hash('c')).await.unwrap();
            let entry = f.service.entry(&hash('c')).await.unwrap().unwrap();
            assert_eq!(entry.hits, n + 1);
            assert!(entry.access_time >= last_access);
            last_access = entry.access_time;
        }
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected_everywhere() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        let bad_hashes = [String::new(), "abc".to_string(), "g".repeat(40), "a".repeat(41)];
        for bad in &bad_hashes {
            assert!(matches!(f.service.is_cached(bad).await, Err(ServerError::ValidationError(_))));
            assert!(matches!(f.service.fetch(bad).await, Err(ServerError::ValidationError(_))));
            assert!(matches!(f.service.store(bad, b"x").await, Err(ServerError::ValidationError(_))));
        }
        let counters = f.service.counters().await;
        assert_eq!((counters.hits, counters.misses), (0, 0));
    }

    #[tokio::test]
    async fn test_vanished_blob_is_not_found() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        f.service.store(&hash('d'), b"x").await.unwrap();
        f.store.remove(&hash('d')).await.unwrap();

        assert!(matches!(f.service.fetch(&hash('d')).await, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_stores_of_same_hash() {
        let f = Arc::new(fixture(MaintenanceMode::Background, u64::MAX).await);

        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let f = f.clone();
                tokio::spawn(async move { f.service.store(&hash('e'), &[i; 64]).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(f.service.cached_count().await, 1);
        assert_eq!(f.service.entry(&hash('e')).await.unwrap().unwrap().hits, 16);
        let blob = f.service.fetch(&hash('e')).await.unwrap();
        assert_eq!(blob.len(), 64);
        assert!(blob.iter().all(|&b| b == blob[0]));
    }

    #[tokio::test]
    async fn test_due_maintenance_runs_in_order() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        assert!(f.service.run_due_maintenance().await.is_empty());

        f.clock.advance(61.0);
        assert_eq!(f.service.run_due_maintenance().await, vec![MaintenanceTask::Cleanup]);

        f.clock.advance(3600.0);
        assert_eq!(f.service.run_due_maintenance().await, MaintenanceTask::ALL.to_vec());
        assert!(f.service.run_due_maintenance().await.is_empty());
    }

    #[tokio::test]
    async fn test_inline_cleanup_counts_evictions() {
        let f = fixture(MaintenanceMode::Inline, u64::MAX).await;
        f.service.store(&hash('a'), b"old").await.unwrap();

        f.clock.advance(8.0 * SECONDS_PER_DAY);
        // the store call triggers the overdue cleanup, which evicts 'a'
        f.service.store(&hash('b'), b"new").await.unwrap();

        assert!(!f.service.is_cached(&hash('a')).await.unwrap());
        assert!(f.service.is_cached(&hash('b')).await.unwrap());
        assert_eq!(f.service.counters().await.cleaned, 1);
        assert!(f.store.get(&hash('a')).await.is_err());
    }

    #[tokio::test]
    async fn test_size_limit_applied_on_cleanup() {
        let f = fixture(MaintenanceMode::Background, 150).await;
        f.service.store(&hash('a'), &[0; 100]).await.unwrap();
        f.clock.advance(1.0);
        f.service.store(&hash('b'), &[0; 100]).await.unwrap();

        f.service.run_maintenance(MaintenanceTask::Cleanup).await;

        assert!(f.service.entry(&hash('a')).await.unwrap().is_none());
        assert!(f.service.entry(&hash('b')).await.unwrap().is_some());
        assert_eq!(f.service.stats().await.saved_cache_size, 100);
    }

    #[tokio::test]
    async fn test_purge_removes_everything() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        f.service.store(&hash('a'), b"1").await.unwrap();
        f.store.put("stray", b"2").await.unwrap();

        f.service.purge().await.unwrap();

        assert_eq!(f.service.cached_count().await, 0);
        assert!(f.store.is_empty().await);
    }

    async fn open_service(dir: &TempDir, store: &InMemoryContentStore, clock: Arc<ManualClock>) -> CacheService {
        CacheService::new(
            Arc::new(store.clone()),
            PersistenceManager::new(dir.path().join("ctcache.json.gz")),
            EvictionEngine::new(RetentionPolicy::default(), u64::MAX),
            clock,
            CacheSettings::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_save_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = InMemoryContentStore::new();
        let clock = Arc::new(ManualClock::new(START));

        let first = open_service(&dir, &store, clock.clone()).await;
        first.store(&hash('a'), b"1").await.unwrap();
        first.fetch(&hash('a')).await.unwrap();
        first.save_now().await.unwrap();
        let saved = first.entry(&hash('a')).await.unwrap();

        let second = open_service(&dir, &store, clock).await;
        assert_eq!(second.entry(&hash('a')).await.unwrap(), saved);
        assert_eq!(second.counters().await.hits, 0);
    }

    #[tokio::test]
    async fn test_stats_rates() {
        let f = fixture(MaintenanceMode::Background, u64::MAX).await;
        assert_eq!(f.service.hit_rate().await, None);

        f.service.store(&hash('a'), b"1").await.unwrap();
        f.service.is_cached(&hash('a')).await.unwrap();
        f.service.is_cached(&hash('b')).await.unwrap();

        assert_eq!(f.service.hit_rate().await, Some(0.5));
        assert_eq!(f.service.miss_rate().await, Some(0.5));
        let stats = f.service.stats().await;
        assert_eq!(stats.cached_count, 1);
        assert_eq!(stats.hit_count_histogram.get(&2), Some(&1));
    }
}
