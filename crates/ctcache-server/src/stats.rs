//! Usage statistics
//!
//! Pure functions over the index and the running counters. Every ratio is an
//! `Option<f64>`: `None` when the denominator is zero, reported as `"N/A"`.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use crate::clock::SECONDS_PER_DAY;
use crate::index::CacheIndex;

/// Text reported for metrics that cannot be computed yet
pub const NOT_AVAILABLE: &str = "N/A";

/// Process-wide counters, reset only on restart
#[derive(Debug, Clone, PartialEq)]
pub struct RunningCounters {
    pub hits: u64,
    pub misses: u64,
    /// Index entries removed by cleanup cycles
    pub cleaned: u64,
    pub start_time: f64,
    pub save_time: f64,
    pub stats_save_time: f64,
    pub cleanup_time: f64,
}

impl RunningCounters {
    pub fn new(now: f64) -> Self {
        Self {
            hits: 0,
            misses: 0,
            cleaned: 0,
            start_time: now,
            save_time: now,
            stats_save_time: now,
            cleanup_time: now,
        }
    }
}

/// Fraction of lookups that were hits
pub fn hit_rate(counters: &RunningCounters) -> Option<f64> {
    ratio(counters.hits, counters.hits.saturating_add(counters.misses))
}

/// Fraction of lookups that were misses
pub fn miss_rate(counters: &RunningCounters) -> Option<f64> {
    ratio(counters.misses, counters.hits.saturating_add(counters.misses))
}

/// Fraction of all recorded accesses that were repeats rather than insertions
pub fn total_hit_rate(index: &CacheIndex) -> Option<f64> {
    let (repeats, total) = index.all().fold((0u64, 0u64), |(repeats, total), (_, entry)| {
        (
            repeats.saturating_add(entry.hits.saturating_sub(1)),
            total.saturating_add(entry.hits),
        )
    });
    ratio(repeats, total)
}

/// Number of entries per hit count
pub fn hit_count_histogram(index: &CacheIndex) -> BTreeMap<u64, u64> {
    let mut histogram = BTreeMap::new();
    for (_, entry) in index.all() {
        *histogram.entry(entry.hits).or_insert(0) += 1;
    }
    histogram
}

/// Number of entries per whole days since insertion
pub fn age_days_histogram(index: &CacheIndex, now: f64) -> BTreeMap<u64, u64> {
    let mut histogram = BTreeMap::new();
    for (_, entry) in index.all() {
        let age_days = ((now - entry.insert_time) / SECONDS_PER_DAY).floor().max(0.0) as u64;
        *histogram.entry(age_days).or_insert(0) += 1;
    }
    histogram
}

/// Renders a ratio for the plain-text endpoints
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => rate.to_string(),
        None => NOT_AVAILABLE.to_string(),
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// On-disk sizes that the statistics report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageSizes {
    /// Size of the index snapshot file
    pub saved_size_bytes: u64,
    /// Sum of the blob sizes
    pub saved_cache_size: u64,
}

/// Point-in-time copy of every derived metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Set when the snapshot is buffered by a cleanup cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(serialize_with = "rounded")]
    pub uptime_seconds: f64,
    pub saved_size_bytes: u64,
    pub saved_cache_size: u64,
    #[serde(serialize_with = "rounded")]
    pub saved_seconds_ago: f64,
    #[serde(serialize_with = "rounded")]
    pub cleaned_seconds_ago: f64,
    #[serde(serialize_with = "rounded_or_na")]
    pub total_hit_rate: Option<f64>,
    pub hit_count: u64,
    #[serde(serialize_with = "rounded_or_na")]
    pub hit_rate: Option<f64>,
    pub miss_count: u64,
    #[serde(serialize_with = "rounded_or_na")]
    pub miss_rate: Option<f64>,
    pub cached_count: usize,
    pub cleaned_count: u64,
    pub age_days_histogram: BTreeMap<u64, u64>,
    pub hit_count_histogram: BTreeMap<u64, u64>,
}

impl StatsSnapshot {
    pub fn collect(index: &CacheIndex, counters: &RunningCounters, sizes: StorageSizes, now: f64) -> Self {
        Self {
            timestamp: None,
            uptime_seconds: now - counters.start_time,
            saved_size_bytes: sizes.saved_size_bytes,
            saved_cache_size: sizes.saved_cache_size,
            saved_seconds_ago: now - counters.save_time,
            cleaned_seconds_ago: now - counters.cleanup_time,
            total_hit_rate: total_hit_rate(index),
            hit_count: counters.hits,
            hit_rate: hit_rate(counters),
            miss_count: counters.misses,
            miss_rate: miss_rate(counters),
            cached_count: index.count(),
            cleaned_count: counters.cleaned,
            age_days_histogram: age_days_histogram(index, now),
            hit_count_histogram: hit_count_histogram(index),
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Paths reported by `/info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Info {
    pub static_path: String,
    pub save_path: String,
    pub cache_path: String,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn rounded<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round2(*value))
}

fn rounded_or_na<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_f64(round2(*value)),
        None => serializer.serialize_str(NOT_AVAILABLE),
    }
}
