//! Configuration loading and management

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub board: BoardConfig,
    pub harvester: HarvesterConfig,
    pub storage: StorageConfig,
    pub analyzers: AnalyzerConfig,
    pub selector: SelectorConfig,
    pub llm: LlmConfig,
    pub summarizer: SummarizerConfig,
    pub scheduler: SchedulerConfig,
    pub posting: PostingConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub name: String,
    pub api_base: String,
    pub media_base: String,
    pub site_base: String,
    pub requests_per_second: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: "pol".to_string(),
            api_base: "https://a.4cdn.org".to_string(),
            media_base: "https://i.4cdn.org".to_string(),
            site_base: "https://boards.4chan.org".to_string(),
            requests_per_second: 1,
        }
    }
}

impl BoardConfig {
    /// Canonical public URL of a thread
    pub fn thread_url(&self, thread_id: u64) -> String {
        format!("{}/{}/thread/{}", self.site_base, self.name, thread_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub top_by_replies: usize,
    pub newest: usize,
    pub courtesy_delay_min_ms: u64,
    pub courtesy_delay_max_ms: u64,
    pub rate_limit_backoff_min_ms: u64,
    pub rate_limit_backoff_max_ms: u64,
    pub max_rate_limit_retries: u32,
    pub download_media: bool,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            top_by_replies: 20,
            newest: 20,
            courtesy_delay_min_ms: 1000,
            courtesy_delay_max_ms: 3000,
            rate_limit_backoff_min_ms: 30_000,
            rate_limit_backoff_max_ms: 60_000,
            max_rate_limit_retries: 5,
            download_media: false,
        }
    }
}

/// Root of the persisted layout; every other path derives from it
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl StorageConfig {
    pub fn threads_dir(&self) -> PathBuf {
        self.data_dir.join("threads")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    pub fn analyzers_dir(&self) -> PathBuf {
        self.data_dir.join("analyzers")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.data_dir.join("summary.json")
    }

    pub fn overview_path(&self) -> PathBuf {
        self.data_dir.join("overview.json")
    }

    pub fn trend_path(&self) -> PathBuf {
        self.data_dir.join("trend_history.json")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.data_dir.join("article_progress.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("posted.sqlite")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub chunk_threshold_bytes: u64,
    pub max_chunks: usize,
    pub retention_days: i64,
    pub min_free_bytes: u64,
    pub digit_runs_top: usize,
    pub reply_ranking_top: usize,
    pub link_top_domains: usize,
    pub link_samples: usize,
    pub geo_top: usize,
    pub tracked_terms: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: 50 * 1024 * 1024,
            max_chunks: 10,
            retention_days: 7,
            min_free_bytes: 100 * 1024 * 1024,
            digit_runs_top: 100,
            reply_ranking_top: 25,
            link_top_domains: 20,
            link_samples: 10,
            geo_top: 10,
            tracked_terms: ["israel", "zionist", "globalist", "rothschild", "soros", "hebrew"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub required: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { required: 12 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_seconds: 120,
            max_attempts: 3,
            base_backoff_ms: 2000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub sample_percent: u32,
    pub sub_batch_size: usize,
    pub temperature: f32,
    pub trend_min_interval_minutes: i64,
    pub trend_hours: i64,
    pub trend_points_per_hour: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            sample_percent: 30,
            sub_batch_size: 50,
            temperature: 0.2,
            trend_min_interval_minutes: 15,
            trend_hours: 72,
            trend_points_per_hour: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub harvest_interval_seconds: u64,
    pub summarize_interval_seconds: u64,
    pub post_interval_seconds: u64,
    pub summarize_retry_delay_seconds: u64,
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            harvest_interval_seconds: 30 * 60,
            summarize_interval_seconds: 6 * 60 * 60,
            post_interval_seconds: 2 * 60 * 60,
            summarize_retry_delay_seconds: 10 * 60,
            run_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn summarize_retry_delay(&self) -> Duration {
        Duration::from_secs(self.summarize_retry_delay_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    pub enabled: bool,
    pub max_length: usize,
    pub suffix: String,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_length: 300,
            suffix: " #boardwatch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Thread snapshots untouched for longer than this are swept
    pub thread_max_age_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            thread_max_age_days: 3,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
