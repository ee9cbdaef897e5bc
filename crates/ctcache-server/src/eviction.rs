//! Cache eviction
//!
//! A cleanup cycle runs three passes in a fixed order:
//!
//! 1. metric pass: drop entries that are too old or unused for too long,
//!    where every hit buys extra retention time;
//! 2. invalid pass: drop blobs that have no index entry, and partial writes
//!    the store reports as abandoned;
//! 3. size pass: while the blobs exceed the size limit, drop the least
//!    recently used entries.
//!
//! An evicted entry leaves the index before its blob is deleted, so a failed
//! deletion never blocks a later insertion of the same hash. Such blobs are
//! picked up by the invalid pass of a later cycle.

use ctcache_content_store::{CacheHash, ContentStorage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::SECONDS_PER_DAY;
use crate::index::{CacheEntry, CacheIndex};

/// Retention thresholds of the metric pass, in days
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Entries older than this are always evicted
    pub max_kept_days: f64,
    /// Entries older than `hits * kept_days_per_hit` are evicted
    pub kept_days_per_hit: f64,
    /// Entries not accessed for longer than this are always evicted
    pub max_unused_days: f64,
    /// Entries not accessed for longer than `hits * unused_days_per_hit` are evicted
    pub unused_days_per_hit: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_kept_days: 30.0,
            kept_days_per_hit: 5.0,
            max_unused_days: 7.0,
            unused_days_per_hit: 3.0,
        }
    }
}

impl RetentionPolicy {
    /// Whether `entry` survives the metric pass at time `now`
    pub fn keep(&self, entry: &CacheEntry, now: f64) -> bool {
        let hits = entry.hits as f64;
        let kept_days = (now - entry.insert_time) / SECONDS_PER_DAY;
        let unused_days = (now - entry.access_time) / SECONDS_PER_DAY;

        if kept_days > self.max_kept_days || kept_days > hits * self.kept_days_per_hit {
            return false;
        }
        if unused_days > self.max_unused_days || unused_days > hits * self.unused_days_per_hit {
            return false;
        }
        true
    }
}

/// What one cleanup cycle removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries evicted by the metric pass
    pub by_metric: usize,
    /// Blobs without an index entry that were deleted
    pub invalid_blobs: usize,
    /// Entries evicted by the size pass
    pub by_size: usize,
}

impl EvictionReport {
    /// Index entries removed by this cycle
    pub fn evicted_entries(&self) -> usize {
        self.by_metric + self.by_size
    }
}

/// Applies the cleanup passes to an index and its blob store
#[derive(Debug, Clone)]
pub struct EvictionEngine {
    policy: RetentionPolicy,
    max_cache_size: u64,
}

impl EvictionEngine {
    pub fn new(policy: RetentionPolicy, max_cache_size: u64) -> Self {
        Self {
            policy,
            max_cache_size,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    /// Runs all three passes in order
    pub async fn run(&self, index: &mut CacheIndex, store: &dyn ContentStorage, now: f64) -> EvictionReport {
        let report = EvictionReport {
            by_metric: self.evict_by_metric(index, store, now).await,
            invalid_blobs: self.remove_invalid(index, store).await,
            by_size: self.evict_least_recently_used(index, store).await,
        };

        if report != EvictionReport::default() {
            info!(
                by_metric = report.by_metric,
                invalid_blobs = report.invalid_blobs,
                by_size = report.by_size,
                remaining = index.count(),
                "Cache cleanup finished"
            );
        } else {
            debug!(remaining = index.count(), "Cache cleanup found nothing to remove");
        }
        report
    }

    /// Evicts every entry the retention policy rejects
    pub async fn evict_by_metric(&self, index: &mut CacheIndex, store: &dyn ContentStorage, now: f64) -> usize {
        let expired: Vec<CacheHash> = index
            .all()
            .filter(|(_, entry)| !self.policy.keep(entry, now))
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &expired {
            evict(index, store, hash).await;
        }
        expired.len()
    }

    /// Deletes every blob whose identifier is not in the index
    pub async fn remove_invalid(&self, index: &CacheIndex, store: &dyn ContentStorage) -> usize {
        let mut removed = match store.discard_incomplete().await {
            Ok(discarded) => discarded,
            Err(err) => {
                warn!(error = %err, "Failed to discard incomplete blobs");
                0
            }
        };

        let ids = match store.list().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "Failed to list cached blobs, skipping invalid entry cleanup");
                return removed;
            }
        };

        for id in ids.iter().filter(|id| !index.contains_id(id)) {
            match store.remove(id).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(%id, error = %err, "Failed to remove orphaned blob"),
            }
        }
        removed
    }

    /// Evicts least recently used entries until the blobs fit the size limit
    pub async fn evict_least_recently_used(&self, index: &mut CacheIndex, store: &dyn ContentStorage) -> usize {
        let mut cache_size = match store.total_size().await {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "Failed to measure cache size, skipping size cleanup");
                return 0;
            }
        };
        if cache_size <= self.max_cache_size {
            return 0;
        }

        let mut by_access: Vec<(CacheHash, f64)> = index
            .all()
            .map(|(hash, entry)| (hash.clone(), entry.access_time))
            .collect();
        by_access.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut evicted = 0;
        for (hash, _) in by_access {
            if cache_size <= self.max_cache_size {
                break;
            }
            let size = match store.size(hash.as_str()).await {
                Ok(size) => size,
                Err(err) => {
                    warn!(%hash, error = %err, "Failed to read blob size");
                    0
                }
            };
            cache_size = cache_size.saturating_sub(size);
            evict(index, store, &hash).await;
            evicted += 1;
        }

        debug!(evicted, cache_size, max_cache_size = self.max_cache_size, "Size cleanup done");
        evicted
    }
}

/// Removes `hash` from the index, then deletes its blob on a best-effort basis
async fn evict(index: &mut CacheIndex, store: &dyn ContentStorage, hash: &CacheHash) {
    index.remove(hash);
    if let Err(err) = store.remove(hash.as_str()).await {
        warn!(%hash, error = %err, "Failed to remove evicted blob");
    }
}
