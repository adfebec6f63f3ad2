//! Durable JSON snapshots
//!
//! Every file the pipeline owns is replaced with write-to-temp + rename so
//! readers only ever see a complete document.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::Thread;

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write raw bytes atomically, removing the temp file if anything fails
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path(path);
    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.with_context(|| format!("Failed to write {}", path.display()))
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

/// Read a JSON document, `None` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// One snapshot file per thread id
#[derive(Debug, Clone)]
pub struct ThreadStore {
    dir: PathBuf,
}

impl ThreadStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, thread_id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", thread_id))
    }

    /// Overwrite the stored snapshot of a thread
    pub fn save(&self, thread: &Thread) -> Result<()> {
        write_json_atomic(&self.path_for(thread.id), thread)
    }

    pub fn load(&self, thread_id: u64) -> Result<Option<Thread>> {
        read_json(&self.path_for(thread_id))
    }

    /// Load every stored thread, skipping files that fail to parse
    pub fn load_all(&self) -> Result<Vec<Thread>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut threads = Vec::new();
        let mut skipped = 0;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match read_json::<Thread>(&path) {
                Ok(Some(thread)) => threads.push(thread),
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping unreadable thread file {}: {:#}", path.display(), e);
                }
            }
        }

        threads.sort_by(|a, b| b.id.cmp(&a.id));
        debug!("Loaded {} threads ({} skipped)", threads.len(), skipped);
        Ok(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{post, thread};

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path());
        let t = thread(5, "op", vec![post(6, "reply")]);

        store.save(&t).unwrap();
        assert_eq!(store.load(5).unwrap(), Some(t));
        assert!(!dir.path().join("5.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path());

        store.save(&thread(5, "first", vec![])).unwrap();
        store.save(&thread(5, "second", vec![post(6, "new")])).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].comment.as_deref(), Some("second"));
    }

    #[test]
    fn test_load_all_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path());
        store.save(&thread(1, "a", vec![])).unwrap();
        store.save(&thread(2, "b", vec![])).unwrap();
        fs::write(dir.path().join("3.json"), b"{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_load_all_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<u32>> = read_json(&dir.path().join("none.json")).unwrap();
        assert!(value.is_none());
    }
}
