//! Cross-thread narrative overview

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::articles::ArticleAnalysis;
use crate::extractor::excerpt;
use crate::llm::{parse_json_reply, LlmClient};
use crate::models::Thread;
use crate::store::write_json_atomic;

pub const OVERVIEW_SYSTEM: &str = "You write a short analytical overview of what an anonymous \
message board is discussing right now, based on the opening posts of its most active threads. \
Write 2-3 neutral paragraphs of plain prose. Do not quote slurs.";

pub const OVERVIEW_THEMES_SYSTEM: &str = "From these thread summaries, list the five dominant \
discussion themes as short noun phrases. Reply with a JSON array of exactly five strings.";

pub const SENTIMENT_SYSTEM: &str = "From these thread summaries, list the five dominant sentiments \
or emotional tones expressed by posters (for example: anger, mockery, fear). \
Reply with a JSON array of exactly five strings.";

const LIST_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewAnalysis {
    pub generated_at: i64,
    pub thread_ids: Vec<u64>,
    pub narrative: String,
    pub themes: Vec<String>,
    pub sentiments: Vec<String>,
}

pub struct OverviewGenerator {
    llm: Arc<dyn LlmClient>,
    path: PathBuf,
    temperature: f32,
}

impl OverviewGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, path: PathBuf, temperature: f32) -> Self {
        Self {
            llm,
            path,
            temperature,
        }
    }

    async fn list(&self, system: &str, prompt: &str) -> Result<Vec<String>> {
        let reply = self.llm.complete(system, prompt, self.temperature).await?;
        let mut items: Vec<String> = parse_json_reply(&reply)?;
        items.retain(|s| !s.trim().is_empty());
        items.truncate(LIST_SIZE);
        Ok(items)
    }

    /// Issue the narrative, theme and sentiment requests concurrently and
    /// save the result as its own snapshot
    pub async fn generate(&self, threads: &[&Thread], articles: &[ArticleAnalysis]) -> Result<OverviewAnalysis> {
        let openings = threads
            .iter()
            .map(|t| {
                format!(
                    "## {}\n{}",
                    t.title(),
                    excerpt(t.comment.as_deref().unwrap_or(""), 2000)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let summaries = articles
            .iter()
            .map(|a| format!("- {}: {}", a.headline, a.body))
            .collect::<Vec<_>>()
            .join("\n");

        let (narrative, themes, sentiments) = tokio::try_join!(
            async {
                let text = self.llm.complete(OVERVIEW_SYSTEM, &openings, self.temperature).await?;
                Ok::<_, anyhow::Error>(text.trim().to_string())
            },
            self.list(OVERVIEW_THEMES_SYSTEM, &summaries),
            self.list(SENTIMENT_SYSTEM, &summaries),
        )?;

        let overview = OverviewAnalysis {
            generated_at: chrono::Utc::now().timestamp(),
            thread_ids: threads.iter().map(|t| t.id).collect(),
            narrative,
            themes,
            sentiments,
        };
        write_json_atomic(&self.path, &overview)?;
        info!(
            "Overview saved ({} themes, {} sentiments)",
            overview.themes.len(),
            overview.sentiments.len()
        );
        Ok(overview)
    }
}
