//! Batch statistics, theme extraction and the rolling trend series

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::articles::ArticleAnalysis;
use crate::config::SummarizerConfig;
use crate::llm::{parse_json_reply, LlmClient};
use crate::store::{read_json, write_json_atomic};

pub const THEME_COUNT: usize = 5;

pub const THEMES_SYSTEM: &str = "You analyze summaries of message-board threads. Identify the five \
most prominent recurring themes across all of them, each as a short noun phrase. \
Reply with a JSON array of exactly five strings.";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: i64,
    pub mean_percentage: f64,
    pub thread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeMatrix {
    pub generated_at: i64,
    pub thread_count: usize,
    pub mean_percentage: f64,
    pub median_percentage: f64,
    pub total_analyzed: u64,
    pub total_flagged: u64,
    pub themes: Vec<String>,
    pub trend: Vec<TrendPoint>,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Keep the newest `hours` hour buckets inside the window, at most
/// `per_hour` points each with the newest winning; result is oldest first
pub fn prune_trend(points: Vec<TrendPoint>, now: i64, hours: i64, per_hour: usize) -> Vec<TrendPoint> {
    let oldest = now - hours * 3600;
    let mut buckets: BTreeMap<i64, Vec<TrendPoint>> = BTreeMap::new();
    for point in points.into_iter().filter(|p| p.timestamp > oldest) {
        buckets.entry(point.timestamp.div_euclid(3600)).or_default().push(point);
    }

    let newest_buckets: Vec<Vec<TrendPoint>> = buckets
        .into_values()
        .rev()
        .take(hours.max(0) as usize)
        .collect();

    let mut kept = Vec::new();
    for mut bucket in newest_buckets.into_iter().rev() {
        bucket.sort_by_key(|p| p.timestamp);
        let skip = bucket.len().saturating_sub(per_hour);
        kept.extend(bucket.into_iter().skip(skip));
    }
    kept
}

pub struct ThemeMatrixAnalyzer {
    llm: Arc<dyn LlmClient>,
    trend_path: PathBuf,
    config: SummarizerConfig,
}

impl ThemeMatrixAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, trend_path: PathBuf, config: SummarizerConfig) -> Self {
        Self {
            llm,
            trend_path,
            config,
        }
    }

    pub async fn analyze(&self, articles: &[ArticleAnalysis]) -> Result<ThemeMatrix> {
        let now = chrono::Utc::now().timestamp();
        let percentages: Vec<f64> = articles.iter().map(|a| a.stats.percentage).collect();
        let mean_percentage = mean(&percentages);

        let themes = match self.extract_themes(articles).await {
            Ok(themes) => themes,
            Err(e) => {
                warn!("Theme extraction failed, continuing without themes: {:#}", e);
                Vec::new()
            }
        };

        let point = TrendPoint {
            timestamp: now,
            mean_percentage,
            thread_count: articles.len(),
        };
        let trend = match self.update_trend(point) {
            Ok(trend) => trend,
            Err(e) => {
                warn!("Trend update failed, continuing without trend: {:#}", e);
                Vec::new()
            }
        };

        Ok(ThemeMatrix {
            generated_at: now,
            thread_count: articles.len(),
            mean_percentage,
            median_percentage: median(&percentages),
            total_analyzed: articles.iter().map(|a| a.stats.analyzed as u64).sum(),
            total_flagged: articles.iter().map(|a| a.stats.flagged as u64).sum(),
            themes,
            trend,
        })
    }

    async fn extract_themes(&self, articles: &[ArticleAnalysis]) -> Result<Vec<String>> {
        let prompt = articles
            .iter()
            .map(|a| format!("- {}: {}", a.headline, a.body))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = self
            .llm
            .complete(THEMES_SYSTEM, &prompt, self.config.temperature)
            .await?;
        let mut themes: Vec<String> = parse_json_reply(&reply)?;
        themes.retain(|t| !t.trim().is_empty());
        themes.truncate(THEME_COUNT);
        Ok(themes)
    }

    /// Append `point` unless the last one is too recent, then prune and save
    pub fn update_trend(&self, point: TrendPoint) -> Result<Vec<TrendPoint>> {
        let mut points: Vec<TrendPoint> = read_json(&self.trend_path)?.unwrap_or_default();
        points.sort_by_key(|p| p.timestamp);

        let min_gap = self.config.trend_min_interval_minutes * 60;
        match points.last() {
            Some(last) if point.timestamp - last.timestamp < min_gap => {
                debug!("Last trend point is under {} minutes old; not appending", self.config.trend_min_interval_minutes);
            }
            _ => points.push(point),
        }

        let points = prune_trend(
            points,
            point.timestamp,
            self.config.trend_hours,
            self.config.trend_points_per_hour,
        );
        write_json_atomic(&self.trend_path, &points)?;
        Ok(points)
    }
}
