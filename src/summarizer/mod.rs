//! Batch summarization pipeline
//!
//! `load progress -> analyze remaining threads -> (matrix || overview) ->
//! save snapshot -> clear progress`. Article generation runs first because
//! both later stages consume its output.

pub mod articles;
pub mod checkpoint;
pub mod matrix;
pub mod overview;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub use articles::{AntisemitismStats, ArticleAnalysis, ArticleGenerator};
pub use checkpoint::{Checkpoint, Progress};
pub use matrix::{ThemeMatrix, ThemeMatrixAnalyzer, TrendPoint};
pub use overview::{OverviewAnalysis, OverviewGenerator};

use crate::config::{SelectorConfig, StorageConfig, SummarizerConfig};
use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::models::Thread;
use crate::scheduler::Job;
use crate::selector::ThreadSelector;
use crate::store::{read_json, write_json_atomic, ThreadStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleBatch {
    pub generated_at: i64,
    pub thread_ids: Vec<u64>,
    pub articles: Vec<ArticleAnalysis>,
}

/// The combined snapshot readers consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub generated_at: i64,
    pub batch: ArticleBatch,
    pub matrix: ThemeMatrix,
    pub overview: OverviewAnalysis,
}

impl Summary {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

pub struct Summarizer {
    store: ThreadStore,
    selector: ThreadSelector,
    checkpoint: Checkpoint,
    articles: ArticleGenerator,
    matrix: ThemeMatrixAnalyzer,
    overview: OverviewGenerator,
    summary_path: PathBuf,
}

impl Summarizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        storage: &StorageConfig,
        selector: &SelectorConfig,
        config: &SummarizerConfig,
    ) -> Self {
        let checkpoint = Checkpoint::new(storage.progress_path());
        Self {
            store: ThreadStore::new(storage.threads_dir()),
            selector: ThreadSelector::new(selector.required),
            articles: ArticleGenerator::new(llm.clone(), checkpoint.clone(), config.clone()),
            matrix: ThemeMatrixAnalyzer::new(llm.clone(), storage.trend_path(), config.clone()),
            overview: OverviewGenerator::new(llm, storage.overview_path(), config.temperature),
            checkpoint,
            summary_path: storage.summary_path(),
        }
    }

    /// Reuse an interrupted selection when all of its threads are still
    /// stored; otherwise select afresh
    fn plan<'a>(&self, pool: &'a [Thread]) -> Result<Vec<&'a Thread>> {
        let by_id: HashMap<u64, &Thread> = pool.iter().map(|t| (t.id, t)).collect();

        if let Some(progress) = self.checkpoint.load() {
            let resumed: Option<Vec<&Thread>> = progress.thread_ids.iter().map(|id| by_id.get(id).copied()).collect();
            match resumed {
                Some(threads) if !threads.is_empty() => {
                    info!(
                        "Resuming batch: {}/{} threads already complete",
                        progress.completed.len(),
                        threads.len()
                    );
                    return Ok(threads);
                }
                _ => info!("Checkpointed selection is no longer available; selecting afresh"),
            }
        }

        let mut rng = StdRng::from_entropy();
        Ok(self.selector.select(pool, &mut rng).require()?)
    }

    /// One full summarization run
    pub async fn summarize(&self) -> Result<Summary> {
        let pool = self.store.load_all()?;
        info!("Summarizing from a pool of {} stored threads", pool.len());
        let threads = self.plan(&pool)?;
        let thread_ids: Vec<u64> = threads.iter().map(|t| t.id).collect();

        let articles = self.articles.resume(&threads).await?;
        if articles.is_empty() {
            return Err(PipelineError::EmptyBatch.into());
        }

        let (matrix, overview) = tokio::try_join!(
            self.matrix.analyze(&articles),
            self.overview.generate(&threads, &articles),
        )?;

        let now = chrono::Utc::now().timestamp();
        let summary = Summary {
            generated_at: now,
            batch: ArticleBatch {
                generated_at: now,
                thread_ids,
                articles,
            },
            matrix,
            overview,
        };
        write_json_atomic(&self.summary_path, &summary).context("Failed to save summary snapshot")?;
        self.checkpoint.clear();

        info!(
            "Summary saved: {} articles, mean {:.1}%",
            summary.batch.articles.len(),
            summary.matrix.mean_percentage
        );
        Ok(summary)
    }
}

#[async_trait]
impl Job for Summarizer {
    async fn run(&self) -> Result<()> {
        self.summarize().await.map(|_| ())
    }
}
