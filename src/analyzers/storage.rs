//! Chunked, size-bounded, age-bounded result storage
//!
//! Each analyzer owns one directory holding a primary file and, when the
//! serialized results outgrow `chunk_threshold_bytes`, a generation of
//! immutable chunk files. The primary file is the storage descriptor: it
//! lists the live chunk files in order, so loading never has to infer
//! anything from directory contents.
//!
//! A chunked write lands the new chunk generation first, then swaps the
//! descriptor, then rotates the superseded chunks out oldest-first. A crash
//! at any point leaves a descriptor pointing at a complete generation.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::error::PipelineError;
use crate::store::{read_json, remove_if_exists, write_json_atomic};

const PRIMARY_FILE: &str = "results.json";

/// Fields every analyzer result carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    /// Unix seconds
    pub generated_at: i64,
    pub thread_id: u64,
    pub post_id: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResultMeta {
    pub fn new(generated_at: i64, thread_id: u64, post_id: u64) -> Self {
        Self {
            generated_at,
            thread_id,
            post_id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Results with an unset timestamp, thread id or post id are rejected
    pub fn is_valid(&self) -> bool {
        self.generated_at != 0 && self.thread_id != 0 && self.post_id != 0
    }
}

/// A typed analyzer result that can live in a [`ResultStore`]
pub trait AnalyzerRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    fn meta(&self) -> &ResultMeta;
}

/// Limits shared by every analyzer store
#[derive(Debug, Clone)]
pub struct StorageLimits {
    pub chunk_threshold_bytes: u64,
    pub max_chunks: usize,
    pub retention_days: i64,
    pub min_free_bytes: u64,
}

impl From<&AnalyzerConfig> for StorageLimits {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            chunk_threshold_bytes: config.chunk_threshold_bytes,
            max_chunks: config.max_chunks.max(1),
            retention_days: config.retention_days,
            min_free_bytes: config.min_free_bytes,
        }
    }
}

/// On-disk primary file
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct PrimaryFile<T> {
    last_updated: i64,
    #[serde(default)]
    chunked: bool,
    #[serde(default)]
    chunks: Vec<ChunkRef>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Descriptor entry for one chunk file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub file: String,
    /// Write time of the chunk, used by the retention purge
    pub created_at: i64,
    pub len: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ChunkFile<T> {
    created_at: i64,
    index: usize,
    results: Vec<T>,
}

/// What a read-only consumer sees
#[derive(Debug, Clone, PartialEq)]
pub enum StoreView<T> {
    NoResults,
    Results { last_updated: i64, results: Vec<T> },
}

/// Outcome of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub written: usize,
    pub filtered: usize,
    pub chunks: usize,
}

/// Typed store rooted at one analyzer directory
#[derive(Debug)]
pub struct ResultStore<T> {
    name: String,
    dir: PathBuf,
    limits: StorageLimits,
    _record: PhantomData<fn() -> T>,
}

impl<T: AnalyzerRecord> ResultStore<T> {
    pub fn new(name: &str, root: &Path, limits: StorageLimits) -> Self {
        Self {
            name: name.to_string(),
            dir: root.join(name),
            limits,
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(PRIMARY_FILE)
    }

    fn read_primary(&self) -> Result<Option<PrimaryFile<T>>> {
        read_json(&self.primary_path())
    }

    /// Chunk descriptors of the current generation, in load order
    pub fn chunk_refs(&self) -> Result<Vec<ChunkRef>> {
        Ok(self
            .read_primary()?
            .map(|p| sorted_chunks(p.chunks))
            .unwrap_or_default())
    }

    /// Primary results followed by every chunk's results in file-name order
    pub fn load(&self) -> Result<Vec<T>> {
        let Some(primary) = self.read_primary()? else {
            return Ok(Vec::new());
        };

        let mut results = primary.results;
        for chunk in sorted_chunks(primary.chunks) {
            let path = self.dir.join(&chunk.file);
            match read_json::<ChunkFile<T>>(&path) {
                Ok(Some(file)) => results.extend(file.results),
                Ok(None) => warn!("[{}] chunk {} listed but missing", self.name, chunk.file),
                Err(e) => warn!("[{}] skipping unreadable chunk {}: {:#}", self.name, chunk.file, e),
            }
        }
        Ok(results)
    }

    /// Read-only view for external consumers
    pub fn view(&self) -> Result<StoreView<T>> {
        let Some(primary) = self.read_primary()? else {
            return Ok(StoreView::NoResults);
        };
        let last_updated = primary.last_updated;
        let results = self.load()?;
        if results.is_empty() {
            Ok(StoreView::NoResults)
        } else {
            Ok(StoreView::Results {
                last_updated,
                results,
            })
        }
    }

    /// Replace the stored result set with `results`
    pub fn write(&self, results: Vec<T>) -> Result<WriteStats> {
        let total = results.len();
        let results: Vec<T> = results.into_iter().filter(|r| r.meta().is_valid()).collect();
        let filtered = total - results.len();
        let written = results.len();
        if filtered > 0 {
            warn!(
                "[{}] filtered {} invalid results (unset timestamp, thread or post id)",
                self.name, filtered
            );
        }

        let serialized = serde_json::to_vec(&results)?;
        let size = serialized.len() as u64;
        self.ensure_disk_space(size)?;

        let previous = self.chunk_refs()?;
        let now = chrono::Utc::now().timestamp();

        let chunks = if size > self.limits.chunk_threshold_bytes && !results.is_empty() {
            let wanted = size.div_ceil(self.limits.chunk_threshold_bytes.max(1)) as usize;
            let count = wanted
                .max(2)
                .min(self.limits.max_chunks)
                .min(results.len())
                .max(1);
            let chunks = self.write_chunks(&results, count, now)?;
            write_json_atomic(
                &self.primary_path(),
                &PrimaryFile::<T> {
                    last_updated: now,
                    chunked: true,
                    chunks: chunks.clone(),
                    results: Vec::new(),
                },
            )?;
            info!(
                "[{}] stored {} results across {} chunk files ({} bytes)",
                self.name,
                written,
                chunks.len(),
                size
            );
            chunks
        } else {
            write_json_atomic(
                &self.primary_path(),
                &PrimaryFile {
                    last_updated: now,
                    chunked: false,
                    chunks: Vec::new(),
                    results,
                },
            )?;
            debug!("[{}] stored {} results", self.name, written);
            Vec::new()
        };

        self.rotate_out(previous, &chunks);

        Ok(WriteStats {
            written,
            filtered,
            chunks: chunks.len(),
        })
    }

    fn write_chunks(&self, results: &[T], count: usize, now: i64) -> Result<Vec<ChunkRef>> {
        let per_chunk = results.len().div_ceil(count);
        let mut refs = Vec::with_capacity(count);

        for (index, slice) in results.chunks(per_chunk).enumerate() {
            let file = format!("chunk-{:013}-{:03}.json", now, index);
            write_json_atomic(
                &self.dir.join(&file),
                &ChunkFile {
                    created_at: now,
                    index,
                    results: slice.to_vec(),
                },
            )?;
            refs.push(ChunkRef {
                file,
                created_at: now,
                len: slice.len(),
            });
        }
        Ok(refs)
    }

    /// Delete superseded chunk files, oldest first
    fn rotate_out(&self, previous: Vec<ChunkRef>, live: &[ChunkRef]) {
        for chunk in sorted_chunks(previous) {
            if live.iter().any(|c| c.file == chunk.file) {
                continue;
            }
            if let Err(e) = remove_if_exists(&self.dir.join(&chunk.file)) {
                warn!("[{}] failed to rotate out {}: {:#}", self.name, chunk.file, e);
            }
        }
    }

    /// Drop primary results and chunk files older than the retention window
    pub fn purge_old_results(&self) -> Result<usize> {
        let Some(mut primary) = self.read_primary()? else {
            return Ok(0);
        };

        let cutoff = chrono::Utc::now().timestamp() - self.limits.retention_days * 86_400;

        let before = primary.results.len();
        primary.results.retain(|r| r.meta().generated_at >= cutoff);
        let mut removed = before - primary.results.len();

        let (expired, kept): (Vec<ChunkRef>, Vec<ChunkRef>) = primary
            .chunks
            .drain(..)
            .partition(|c| c.created_at < cutoff);
        primary.chunks = kept;

        if removed == 0 && expired.is_empty() {
            return Ok(0);
        }

        self.ensure_disk_space(0)?;
        primary.chunked = !primary.chunks.is_empty();
        write_json_atomic(&self.primary_path(), &primary)?;

        for chunk in sorted_chunks(expired) {
            removed += chunk.len;
            remove_if_exists(&self.dir.join(&chunk.file))
                .with_context(|| format!("[{}] failed to delete expired chunk", self.name))?;
        }

        info!("[{}] purged {} results older than {} days", self.name, removed, self.limits.retention_days);
        Ok(removed)
    }

    /// Refuse to write when free space would drop below the configured floor
    fn ensure_disk_space(&self, needed: u64) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let available = match fs4::available_space(&self.dir) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("[{}] free-space query unavailable, assuming enough: {}", self.name, e);
                return Ok(());
            }
        };

        let required = self.limits.min_free_bytes.saturating_add(needed);
        if available < required {
            return Err(PipelineError::InsufficientDiskSpace {
                path: self.dir.display().to_string(),
                available,
                required,
            }
            .into());
        }
        Ok(())
    }
}

fn sorted_chunks(mut chunks: Vec<ChunkRef>) -> Vec<ChunkRef> {
    chunks.sort_by(|a, b| a.file.cmp(&b.file));
    chunks
}
