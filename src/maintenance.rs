//! Retention sweep and storage statistics
//!
//! Thread snapshots and downloaded media are deleted once their last write is
//! older than the configured age. Analyzer stores apply their own retention
//! window through the registry.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::config::{RetentionConfig, StorageConfig};

/// File-level maintenance over the persisted layout
pub struct Maintenance {
    threads_dir: PathBuf,
    media_dir: PathBuf,
    analyzers_dir: PathBuf,
    config: RetentionConfig,
}

impl Maintenance {
    pub fn new(storage: &StorageConfig, config: RetentionConfig) -> Self {
        Self {
            threads_dir: storage.threads_dir(),
            media_dir: storage.media_dir(),
            analyzers_dir: storage.analyzers_dir(),
            config,
        }
    }

    fn cutoff(&self) -> SystemTime {
        let age = Duration::from_secs(self.config.thread_max_age_days.max(0) as u64 * 86400);
        SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Delete thread snapshots and media older than the retention age
    pub fn sweep_threads(&self) -> Result<MaintenanceStats> {
        let cutoff = self.cutoff();
        let mut stats = MaintenanceStats::default();

        let (count, bytes) = sweep_dir(&self.threads_dir, cutoff, Some("json"))?;
        stats.threads_deleted = count;
        stats.bytes_freed += bytes;

        let (count, bytes) = sweep_dir(&self.media_dir, cutoff, None)?;
        stats.media_deleted = count;
        stats.bytes_freed += bytes;

        if stats.threads_deleted > 0 || stats.media_deleted > 0 {
            info!(
                "Swept {} threads and {} media files ({})",
                stats.threads_deleted,
                stats.media_deleted,
                format_bytes(stats.bytes_freed)
            );
        }
        Ok(stats)
    }

    /// Get current storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        let (thread_count, thread_bytes) = dir_usage(&self.threads_dir)?;
        let (media_count, media_bytes) = dir_usage(&self.media_dir)?;

        let mut analyzers = Vec::new();
        if self.analyzers_dir.is_dir() {
            for entry in std::fs::read_dir(&self.analyzers_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    let (files, bytes) = dir_usage(&entry.path())?;
                    analyzers.push((entry.file_name().to_string_lossy().into_owned(), files, bytes));
                }
            }
        }
        analyzers.sort();

        Ok(StorageStats {
            thread_count,
            thread_bytes,
            media_count,
            media_bytes,
            analyzers,
        })
    }
}

/// Remove regular files last modified before `cutoff`
fn sweep_dir(dir: &Path, cutoff: SystemTime, extension: Option<&str>) -> Result<(u64, u64)> {
    if !dir.is_dir() {
        return Ok((0, 0));
    }

    let mut count = 0;
    let mut bytes = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if extension.is_some() && path.extension().and_then(|e| e.to_str()) != extension {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        if metadata.modified()? >= cutoff {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                count += 1;
                bytes += metadata.len();
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok((count, bytes))
}

/// Regular file count and total size directly under `dir`
fn dir_usage(dir: &Path) -> Result<(u64, u64)> {
    if !dir.is_dir() {
        return Ok((0, 0));
    }
    let mut count = 0;
    let mut bytes = 0;
    for entry in std::fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            count += 1;
            bytes += metadata.len();
        }
    }
    Ok((count, bytes))
}

#[derive(Debug, Default)]
pub struct MaintenanceStats {
    pub threads_deleted: u64,
    pub media_deleted: u64,
    pub bytes_freed: u64,
}

#[derive(Debug)]
pub struct StorageStats {
    pub thread_count: u64,
    pub thread_bytes: u64,
    pub media_count: u64,
    pub media_bytes: u64,
    /// (analyzer, files, bytes)
    pub analyzers: Vec<(String, u64, u64)>,
}

impl StorageStats {
    pub fn print_report(&self) {
        println!("\n{}", "=".repeat(50));
        println!("STORAGE STATISTICS");
        println!("{}", "=".repeat(50));
        println!("\nThreads:");
        println!("  Snapshots:        {:>10}", self.thread_count);
        println!("  Size:             {:>10}", format_bytes(self.thread_bytes));
        println!("\nMedia:");
        println!("  Files:            {:>10}", self.media_count);
        println!("  Size:             {:>10}", format_bytes(self.media_bytes));
        println!("\nAnalyzers:");
        if self.analyzers.is_empty() {
            println!("  (none)");
        }
        for (name, files, bytes) in &self.analyzers {
            println!("  {:<16}{:>4} files {:>10}", name, files, format_bytes(*bytes));
        }
        let total = self.thread_bytes
            + self.media_bytes
            + self.analyzers.iter().map(|(_, _, b)| b).sum::<u64>();
        println!("\nTotal:              {:>10}", format_bytes(total));
    }
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}
