//! Article generation progress checkpoint
//!
//! Present on disk only while a batch is in flight. Holds the selected
//! thread ids and every analysis finished so far, in completion order.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::articles::ArticleAnalysis;
use crate::store::{read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// The batch selection, in processing order
    pub thread_ids: Vec<u64>,
    pub completed: Vec<ArticleAnalysis>,
    pub updated_at: i64,
}

impl Progress {
    pub fn new(thread_ids: Vec<u64>) -> Self {
        Self {
            thread_ids,
            completed: Vec::new(),
            updated_at: 0,
        }
    }

    pub fn completed_ids(&self) -> HashSet<u64> {
        self.completed.iter().map(|a| a.thread_id).collect()
    }

    pub fn is_completed(&self, thread_id: u64) -> bool {
        self.completed.iter().any(|a| a.thread_id == thread_id)
    }

    /// Selected ids not yet completed, in selection order
    pub fn pending(&self) -> Vec<u64> {
        let done = self.completed_ids();
        self.thread_ids.iter().copied().filter(|id| !done.contains(id)).collect()
    }

    /// Drop completed entries that fall outside the selection
    pub fn retain_selected(&mut self) {
        let selected: HashSet<u64> = self.thread_ids.iter().copied().collect();
        self.completed.retain(|a| selected.contains(&a.thread_id));
    }

    pub fn record(&mut self, analysis: ArticleAnalysis) {
        self.completed.retain(|a| a.thread_id != analysis.thread_id);
        self.completed.push(analysis);
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved progress; an unreadable file counts as no progress
    pub fn load(&self) -> Option<Progress> {
        match read_json::<Progress>(&self.path) {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {}: {:#}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, progress: &Progress) -> Result<()> {
        write_json_atomic(&self.path, progress)?;
        debug!(
            "Checkpointed {}/{} threads",
            progress.completed.len(),
            progress.thread_ids.len()
        );
        Ok(())
    }

    /// Best-effort removal once the batch is complete
    pub fn clear(&self) {
        if let Err(e) = remove_if_exists(&self.path) {
            warn!("Failed to clear checkpoint: {:#}", e);
        }
    }
}
