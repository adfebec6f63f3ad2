//! Outbound posting of finished articles
//!
//! The third-party client sits behind [`PostingClient`]; only a dry-run
//! implementation ships. The ledger keeps a thread from being posted twice.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::config::{BoardConfig, PostingConfig};
use crate::db::Database;
use crate::scheduler::Job;
use crate::summarizer::{ArticleAnalysis, Summary};

const ELLIPSIS: char = '…';

#[async_trait]
pub trait PostingClient: Send + Sync {
    /// Publish `text`, returning the id the service assigned
    async fn publish(&self, text: &str) -> Result<String>;
}

/// Logs the payload instead of sending it
#[derive(Default)]
pub struct DryRunPostingClient {
    counter: AtomicU64,
}

#[async_trait]
impl PostingClient for DryRunPostingClient {
    async fn publish(&self, text: &str) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("dry-run-{}-{}", chrono::Utc::now().timestamp(), n);
        info!("[dry run] would publish {} chars as {}:\n{}", text.chars().count(), id, text);
        Ok(id)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.truncate(out.trim_end().len());
    out.push(ELLIPSIS);
    out
}

/// Render an article as `headline\n\nbody\n\nurl+suffix` within `max_length` chars
///
/// The URL and suffix are always kept whole. The body is cut first, then the
/// headline if even that does not fit. Fails when the link and suffix leave no
/// room for a headline.
pub fn format_post(article: &ArticleAnalysis, url: &str, suffix: &str, max_length: usize) -> Result<String> {
    let tail = format!("{}{}", url, suffix);
    let fixed = tail.chars().count();
    if fixed + 3 > max_length {
        bail!(
            "Link and suffix ({} chars) leave no room for a headline within {} chars",
            fixed,
            max_length
        );
    }

    let headline = truncate_chars(article.headline.trim(), max_length.saturating_sub(fixed + 2));
    let used = headline.chars().count() + 2 + fixed;
    let body_room = max_length.saturating_sub(used + 2);
    let body = article.body.trim();

    if body.is_empty() || body_room < 2 {
        return Ok(format!("{}\n\n{}", headline, tail));
    }
    Ok(format!("{}\n\n{}\n\n{}", headline, truncate_chars(body, body_room), tail))
}

/// Lowest reply count first; ties go to the older thread
pub fn posting_order(articles: &[ArticleAnalysis]) -> Vec<&ArticleAnalysis> {
    let mut ordered: Vec<&ArticleAnalysis> = articles.iter().collect();
    ordered.sort_by_key(|a| (a.reply_count, a.thread_id));
    ordered
}

pub struct Poster {
    client: Arc<dyn PostingClient>,
    ledger: Mutex<Database>,
    summary_path: PathBuf,
    board: BoardConfig,
    config: PostingConfig,
}

impl Poster {
    pub fn new(
        client: Arc<dyn PostingClient>,
        ledger: Database,
        summary_path: PathBuf,
        board: BoardConfig,
        config: PostingConfig,
    ) -> Self {
        Self {
            client,
            ledger: Mutex::new(ledger),
            summary_path,
            board,
            config,
        }
    }

    fn ledger(&self) -> Result<MutexGuard<'_, Database>> {
        self.ledger.lock().map_err(|_| anyhow!("posting ledger lock poisoned"))
    }

    /// Publish the next unposted article, if any; returns (thread id, external id)
    pub async fn post_next(&self) -> Result<Option<(u64, String)>> {
        if !self.config.enabled {
            info!("Posting is disabled; skipping");
            return Ok(None);
        }

        let Some(summary) = Summary::load(&self.summary_path)? else {
            info!("No summary available yet; nothing to post");
            return Ok(None);
        };

        let next = {
            let ledger = self.ledger()?;
            let mut next = None;
            for article in posting_order(&summary.batch.articles) {
                if !ledger.is_posted(article.thread_id)? {
                    next = Some(article.clone());
                    break;
                }
            }
            next
        };
        let Some(article) = next else {
            info!("Every article in the current summary has been posted");
            return Ok(None);
        };

        let text = format_post(
            &article,
            &self.board.thread_url(article.thread_id),
            &self.config.suffix,
            self.config.max_length,
        )?;
        let external_id = self.client.publish(&text).await?;
        self.ledger()?.record_post(article.thread_id, &external_id)?;

        info!("Posted thread {} as {}", article.thread_id, external_id);
        Ok(Some((article.thread_id, external_id)))
    }
}

#[async_trait]
impl Job for Poster {
    async fn run(&self) -> Result<()> {
        self.post_next().await.map(|_| ())
    }
}
