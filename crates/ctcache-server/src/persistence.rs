//! Durable state of the service
//!
//! The index snapshot, the buffered statistics files and the chart images
//! all live here. Everything on disk is gzip-compressed JSON except charts.

use ctcache_content_store::CacheHash;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::index::{CacheEntry, CacheIndex};
use crate::stats::StatsSnapshot;

/// Reads and writes the snapshot, statistics and chart files
#[derive(Debug, Clone)]
pub struct PersistenceManager {
    save_path: PathBuf,
    stats_path: Option<PathBuf>,
    chart_path: Option<PathBuf>,
}

impl PersistenceManager {
    pub fn new(save_path: impl Into<PathBuf>) -> Self {
        Self {
            save_path: save_path.into(),
            stats_path: None,
            chart_path: None,
        }
    }

    /// Directory receiving `ctcache-stats-*.json.gz` files
    pub fn with_stats_path(mut self, stats_path: Option<PathBuf>) -> Self {
        self.stats_path = stats_path;
        self
    }

    /// Directory receiving `ctcache-hits-*.svg` files
    pub fn with_chart_path(mut self, chart_path: Option<PathBuf>) -> Self {
        self.chart_path = chart_path;
        self
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Writes the index snapshot and returns its size in bytes.
    ///
    /// The data goes to a sibling temporary file first, so an interrupted
    /// save leaves the previous snapshot intact.
    pub async fn save(&self, index: &CacheIndex) -> ServerResult<u64> {
        let entries: BTreeMap<&str, &CacheEntry> = index.all().map(|(hash, entry)| (hash.as_str(), entry)).collect();
        let json = serde_json::to_vec(&entries)?;
        let compressed = compress(&json).map_err(|e| persistence_error(&self.save_path, e))?;

        if let Some(parent) = self.save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_error(parent, e))?;
        }

        let temp_path = sibling_temp_path(&self.save_path);
        if let Err(err) = tokio::fs::write(&temp_path, &compressed).await {
            remove_temp_file(&temp_path).await;
            return Err(persistence_error(&temp_path, err));
        }
        if let Err(err) = tokio::fs::rename(&temp_path, &self.save_path).await {
            remove_temp_file(&temp_path).await;
            return Err(persistence_error(&self.save_path, err));
        }

        debug!(path = %self.save_path.display(), entries = index.count(), bytes = compressed.len(), "Saved cache index");
        Ok(compressed.len() as u64)
    }

    /// Restores the index from the snapshot.
    ///
    /// Never fails: a missing or unreadable snapshot yields an empty index,
    /// and malformed entries are skipped.
    pub async fn load(&self) -> CacheIndex {
        let compressed = match tokio::fs::read(&self.save_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.save_path.display(), "No saved cache index, starting empty");
                return CacheIndex::new();
            }
            Err(err) => {
                warn!(path = %self.save_path.display(), error = %err, "Failed to read cache index");
                return CacheIndex::new();
            }
        };

        let raw: HashMap<String, Value> = match decompress(&compressed)
            .map_err(ServerError::from)
            .and_then(|json| serde_json::from_slice(&json).map_err(ServerError::from))
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %self.save_path.display(), error = %err, "Failed to decode cache index");
                return CacheIndex::new();
            }
        };

        let index: CacheIndex = raw
            .into_iter()
            .filter_map(|(id, value)| {
                let Ok(hash) = CacheHash::parse(&id) else {
                    debug!(id = %id, "Skipping saved entry with invalid hash");
                    return None;
                };
                match serde_json::from_value::<CacheEntry>(value) {
                    Ok(entry) => Some((hash, entry)),
                    Err(err) => {
                        debug!(hash = %hash, error = %err, "Skipping malformed saved entry");
                        None
                    }
                }
            })
            .collect();

        info!(path = %self.save_path.display(), entries = index.count(), "Loaded cache index");
        index
    }

    /// Size of the snapshot file, 0 if it does not exist
    pub async fn save_file_size(&self) -> u64 {
        tokio::fs::metadata(&self.save_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Writes the buffered snapshots to a new timestamped file.
    ///
    /// The buffer is cleared on success and also when no usable stats
    /// directory exists. A failed write keeps the buffer for the next try.
    pub async fn flush_stats(&self, buffer: &mut Vec<StatsSnapshot>, now: f64) -> ServerResult<Option<PathBuf>> {
        let Some(dir) = existing_dir(self.stats_path.as_deref()).await else {
            buffer.clear();
            return Ok(None);
        };
        if buffer.is_empty() {
            return Ok(None);
        }

        let path = dir.join(format!("ctcache-stats-{:012}.json.gz", now as u64));
        let json = serde_json::to_vec(buffer)?;
        let compressed = compress(&json).map_err(|e| persistence_error(&path, e))?;
        tokio::fs::write(&path, compressed)
            .await
            .map_err(|e| persistence_error(&path, e))?;

        debug!(path = %path.display(), snapshots = buffer.len(), "Saved statistics");
        buffer.clear();
        Ok(Some(path))
    }

    /// Writes a chart image to a new timestamped file, if a chart directory exists
    pub async fn save_chart(&self, svg: &str, now: f64) -> ServerResult<Option<PathBuf>> {
        let Some(dir) = existing_dir(self.chart_path.as_deref()).await else {
            return Ok(None);
        };

        let path = dir.join(format!("ctcache-hits-{:012}.svg", now as u64));
        tokio::fs::write(&path, svg)
            .await
            .map_err(|e| persistence_error(&path, e))?;
        Ok(Some(path))
    }

    /// All saved statistics as one JSON array, produced chunk by chunk.
    ///
    /// Files are read lazily in filename order. Unreadable files are skipped.
    pub fn saved_stats_stream(&self) -> impl Stream<Item = std::io::Result<String>> + Send + 'static {
        let state = StatsStreamState {
            stats_path: self.stats_path.clone(),
            files: None,
            pending: VecDeque::new(),
            first: true,
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                if let Some(value) = state.pending.pop_front() {
                    let separator = if state.first { "[" } else { "," };
                    state.first = false;
                    return Some((Ok(format!("{}{}", separator, value)), state));
                }
                if state.files.is_none() {
                    state.files = Some(stats_files(state.stats_path.as_deref()).await);
                }
                match state.files.as_mut().and_then(VecDeque::pop_front) {
                    Some(path) => match read_stats_file(&path).await {
                        Ok(values) => state.pending.extend(values),
                        Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable statistics file"),
                    },
                    None => {
                        state.finished = true;
                        let tail = if state.first { "[]" } else { "]" };
                        return Some((Ok(tail.to_string()), state));
                    }
                }
            }
        })
    }
}

struct StatsStreamState {
    stats_path: Option<PathBuf>,
    /// Not listed until the first chunk is requested
    files: Option<VecDeque<PathBuf>>,
    pending: VecDeque<Value>,
    first: bool,
    finished: bool,
}

async fn stats_files(dir: Option<&Path>) -> VecDeque<PathBuf> {
    let Some(dir) = existing_dir(dir).await else {
        return VecDeque::new();
    };
    match list_files(dir).await {
        Ok(mut files) => {
            files.sort();
            files.into()
        }
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "Failed to list statistics directory");
            VecDeque::new()
        }
    }
}

async fn read_stats_file(path: &Path) -> ServerResult<Vec<Value>> {
    let compressed = tokio::fs::read(path).await?;
    let json = decompress(&compressed)?;
    Ok(serde_json::from_slice(&json)?)
}

async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

async fn existing_dir(dir: Option<&Path>) -> Option<&Path> {
    let dir = dir?;
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Some(dir),
        _ => None,
    }
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove temporary index file"),
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut json = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut json)?;
    Ok(json)
}

fn persistence_error(path: &Path, err: std::io::Error) -> ServerError {
    ServerError::PersistenceError(format!("{}: {}", path.display(), err))
}
