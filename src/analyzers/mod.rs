//! Pluggable analyzers over harvested thread batches
//!
//! Every analyzer implements [`Analyzer`] with its own typed record and
//! owns one [`ResultStore`]. The [`Registry`] holds the closed set of
//! analyzers as [`AnalyzerSlot`] variants and runs them sequentially with
//! partial-failure tolerance.

pub mod geo;
pub mod gets;
pub mod links;
pub mod reflinks;
pub mod storage;
pub mod terms;

use anyhow::Result;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::AnalyzerConfig;
use crate::error::PipelineError;
use crate::models::Thread;

pub use geo::{GeoAnalyzer, GeoRecord};
pub use gets::{GetAnalyzer, GetRecord};
pub use links::{LinkAnalyzer, LinkRecord};
pub use reflinks::{ReflinkAnalyzer, ReflinkRecord};
pub use storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits, StoreView, WriteStats};
pub use terms::{TermAnalyzer, TermRecord};

/// Common analyzer interface
///
/// `save_results` merges fresh results with the stored history through
/// [`Analyzer::merge`]; the default replaces history outright.
pub trait Analyzer {
    type Record: AnalyzerRecord;

    fn name(&self) -> &'static str;

    fn store(&self) -> &ResultStore<Self::Record>;

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<Self::Record>>;

    fn merge(&self, _previous: Vec<Self::Record>, fresh: Vec<Self::Record>) -> Vec<Self::Record> {
        fresh
    }

    fn load_results(&self) -> Result<Vec<Self::Record>> {
        self.store().load()
    }

    fn save_results(&self, fresh: Vec<Self::Record>) -> Result<WriteStats> {
        let previous = self.load_results()?;
        let merged = self.merge(previous, fresh);
        self.store().write(merged)
    }

    fn purge_old_results(&self) -> Result<usize> {
        self.store().purge_old_results()
    }
}

/// The closed set of analyzers the registry can hold
pub enum AnalyzerSlot {
    Gets(GetAnalyzer),
    Reflinks(ReflinkAnalyzer),
    Links(LinkAnalyzer),
    Geo(GeoAnalyzer),
    Terms(TermAnalyzer),
}

macro_rules! dispatch {
    ($slot:expr, $a:ident => $body:expr) => {
        match $slot {
            AnalyzerSlot::Gets($a) => $body,
            AnalyzerSlot::Reflinks($a) => $body,
            AnalyzerSlot::Links($a) => $body,
            AnalyzerSlot::Geo($a) => $body,
            AnalyzerSlot::Terms($a) => $body,
        }
    };
}

impl AnalyzerSlot {
    pub fn name(&self) -> &'static str {
        dispatch!(self, a => a.name())
    }

    pub fn store_dir(&self) -> &Path {
        dispatch!(self, a => a.store().dir())
    }

    /// Load stored results, returning how many were found
    pub fn load_results(&self) -> Result<usize> {
        dispatch!(self, a => a.load_results().map(|r| r.len()))
    }

    /// Analyze a batch and persist the merged results
    pub fn run(&mut self, threads: &[Thread]) -> Result<WriteStats> {
        dispatch!(self, a => {
            let fresh = a.analyze(threads)?;
            a.save_results(fresh)
        })
    }

    pub fn purge_old_results(&self) -> Result<usize> {
        dispatch!(self, a => a.purge_old_results())
    }

    /// Stored results as JSON for read-only consumers
    pub fn view_json(&self) -> Result<StoreView<serde_json::Value>> {
        dispatch!(self, a => Ok(match a.store().view()? {
            StoreView::NoResults => StoreView::NoResults,
            StoreView::Results { last_updated, results } => StoreView::Results {
                last_updated,
                results: results
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            },
        }))
    }
}

/// Per-run outcome
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Named analyzers run as one unit
#[derive(Default)]
pub struct Registry {
    analyzers: Vec<AnalyzerSlot>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five analyzers writing under `root`
    pub fn with_defaults(root: &Path, config: &AnalyzerConfig) -> Result<Self> {
        let limits = StorageLimits::from(config);
        let mut registry = Self::new();
        registry.register(AnalyzerSlot::Gets(GetAnalyzer::new(
            root,
            limits.clone(),
            config.digit_runs_top,
        )))?;
        registry.register(AnalyzerSlot::Reflinks(ReflinkAnalyzer::new(
            root,
            limits.clone(),
            config.reply_ranking_top,
        )))?;
        registry.register(AnalyzerSlot::Links(LinkAnalyzer::new(
            root,
            limits.clone(),
            config.link_top_domains,
            config.link_samples,
        )))?;
        registry.register(AnalyzerSlot::Geo(GeoAnalyzer::new(
            root,
            limits.clone(),
            config.geo_top,
        )))?;
        registry.register(AnalyzerSlot::Terms(TermAnalyzer::new(
            root,
            limits,
            &config.tracked_terms,
        )))?;
        Ok(registry)
    }

    /// Add an analyzer; names must be unique
    pub fn register(&mut self, analyzer: AnalyzerSlot) -> Result<()> {
        if self.analyzers.iter().any(|a| a.name() == analyzer.name()) {
            return Err(PipelineError::DuplicateAnalyzer(analyzer.name().to_string()).into());
        }
        info!("Registered analyzer '{}'", analyzer.name());
        self.analyzers.push(analyzer);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&AnalyzerSlot> {
        self.analyzers.iter().find(|a| a.name() == name)
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// Load every analyzer's stored results once, dropping any that fail
    pub fn initialize(&mut self) {
        self.analyzers.retain(|analyzer| match analyzer.load_results() {
            Ok(count) => {
                info!("Analyzer '{}' initialized with {} stored results", analyzer.name(), count);
                true
            }
            Err(e) => {
                error!("Dropping analyzer '{}': initialization failed: {:#}", analyzer.name(), e);
                false
            }
        });
    }

    /// Run every analyzer over the batch; fails only if all of them fail
    pub fn analyze_threads(&mut self, threads: &[Thread]) -> Result<RegistryStats> {
        let mut stats = RegistryStats::default();

        for analyzer in &mut self.analyzers {
            match analyzer.run(threads) {
                Ok(write) => {
                    info!(
                        "Analyzer '{}' stored {} results ({} filtered, {} chunks)",
                        analyzer.name(),
                        write.written,
                        write.filtered,
                        write.chunks
                    );
                    stats.succeeded.push(analyzer.name().to_string());
                }
                Err(e) => {
                    warn!("Analyzer '{}' failed: {:#}", analyzer.name(), e);
                    stats.failed.push((analyzer.name().to_string(), format!("{:#}", e)));
                }
            }
        }

        self.finish("analysis", stats)
    }

    /// Apply the retention window to every analyzer's store
    pub fn purge_old_results(&mut self) -> Result<RegistryStats> {
        let mut stats = RegistryStats::default();

        for analyzer in &self.analyzers {
            match analyzer.purge_old_results() {
                Ok(removed) => {
                    if removed > 0 {
                        info!("Analyzer '{}' purged {} old results", analyzer.name(), removed);
                    }
                    stats.succeeded.push(analyzer.name().to_string());
                }
                Err(e) => {
                    warn!("Analyzer '{}' purge failed: {:#}", analyzer.name(), e);
                    stats.failed.push((analyzer.name().to_string(), format!("{:#}", e)));
                }
            }
        }

        self.finish("purge", stats)
    }

    fn finish(&self, phase: &str, stats: RegistryStats) -> Result<RegistryStats> {
        if !stats.failed.is_empty() && stats.succeeded.is_empty() {
            error!("Every analyzer failed during {}", phase);
            return Err(PipelineError::AllAnalyzersFailed(stats.failed.len()).into());
        }
        if !stats.failed.is_empty() {
            warn!(
                "{} partially succeeded: {} ok, {} failed",
                phase,
                stats.succeeded.len(),
                stats.failed.len()
            );
        }
        Ok(stats)
    }
}

/// Source ids for batch-level rows: the newest thread's root post
pub(crate) fn batch_source(threads: &[Thread]) -> (u64, u64) {
    threads
        .iter()
        .map(|t| t.id)
        .max()
        .map(|id| (id, id))
        .unwrap_or((0, 0))
}
