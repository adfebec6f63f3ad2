//! Per-thread article generation with checkpoint/resume
//!
//! For each selected thread: sample a share of its posts, classify them in
//! fixed-size sub-batches, ask for a headline and body, and checkpoint the
//! accumulated list before moving on.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::checkpoint::{Checkpoint, Progress};
use crate::config::SummarizerConfig;
use crate::extractor::excerpt;
use crate::llm::{parse_json_reply, LlmClient};
use crate::models::{Post, Thread};

pub const CLASSIFY_SYSTEM: &str = "You review anonymous message-board posts for antisemitic content. \
Each post is numbered. Count how many posts you reviewed and how many contain antisemitic content \
(slurs, conspiracy tropes about Jewish people, dehumanization or calls for harm). \
Reply with JSON only: {\"analyzed\": <number>, \"flagged\": <number>}.";

pub const HEADLINE_SYSTEM: &str = "You are a newsroom editor summarizing a message-board thread for a \
monitoring digest. Write a neutral, factual headline (at most 12 words) and a body of 2-4 sentences \
describing what the thread discusses. Do not repeat slurs. \
Reply with JSON only: {\"headline\": \"...\", \"body\": \"...\"}.";

/// Flagged share of the sampled posts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AntisemitismStats {
    pub analyzed: u32,
    pub flagged: u32,
    pub percentage: f64,
}

impl AntisemitismStats {
    pub fn new(analyzed: u32, flagged: u32) -> Self {
        let flagged = flagged.min(analyzed);
        let percentage = if analyzed == 0 {
            0.0
        } else {
            flagged as f64 / analyzed as f64 * 100.0
        };
        Self {
            analyzed,
            flagged,
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub total_posts: usize,
    pub analyzed_posts: usize,
    pub generated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleAnalysis {
    pub thread_id: u64,
    pub headline: String,
    pub body: String,
    pub reply_count: u32,
    pub stats: AntisemitismStats,
    pub source: SourceInfo,
}

#[derive(Deserialize)]
struct ClassifyReply {
    analyzed: u32,
    flagged: u32,
}

#[derive(Deserialize)]
struct HeadlineReply {
    headline: String,
    body: String,
}

/// Posts with text, sampled down to `percent` of the thread (at least one)
fn sample_posts(thread: &Thread, percent: u32) -> Vec<Post> {
    let mut posts: Vec<Post> = thread
        .all_posts()
        .into_iter()
        .filter(|p| !p.body_text().trim().is_empty())
        .collect();
    if posts.is_empty() {
        return posts;
    }

    let wanted = (posts.len() * percent.min(100) as usize).div_ceil(100).max(1);
    posts.shuffle(&mut rand::thread_rng());
    posts.truncate(wanted);
    posts.sort_by_key(|p| p.id);
    posts
}

fn classify_prompt(thread: &Thread, batch: &[Post]) -> String {
    let mut prompt = format!("Thread {} posts ({} total):\n", thread.id, batch.len());
    for (i, post) in batch.iter().enumerate() {
        prompt.push_str(&format!("\n[{}] {}\n", i + 1, excerpt(post.body_text(), 1500)));
    }
    prompt
}

fn headline_prompt(thread: &Thread) -> String {
    let replies: Vec<String> = thread
        .posts
        .iter()
        .filter(|p| !p.body_text().trim().is_empty())
        .take(40)
        .map(|p| format!("- {}", excerpt(p.body_text(), 300)))
        .collect();
    format!(
        "Thread {}\nSubject: {}\nOpening post:\n{}\n\nSample replies:\n{}",
        thread.id,
        thread.title(),
        excerpt(thread.comment.as_deref().unwrap_or(""), 3000),
        replies.join("\n")
    )
}

pub struct ArticleGenerator {
    llm: Arc<dyn LlmClient>,
    checkpoint: Checkpoint,
    config: SummarizerConfig,
}

impl ArticleGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, checkpoint: Checkpoint, config: SummarizerConfig) -> Self {
        Self {
            llm,
            checkpoint,
            config,
        }
    }

    /// Classify sampled posts sub-batch by sub-batch
    async fn classify(&self, thread: &Thread, sample: &[Post]) -> Result<AntisemitismStats> {
        let mut analyzed = 0u32;
        let mut flagged = 0u32;

        for batch in sample.chunks(self.config.sub_batch_size.max(1)) {
            let reply = self
                .llm
                .complete(CLASSIFY_SYSTEM, &classify_prompt(thread, batch), self.config.temperature)
                .await?;
            let parsed: ClassifyReply = parse_json_reply(&reply)?;

            let actual = batch.len() as u32;
            if parsed.analyzed != actual {
                warn!(
                    "Thread {}: model reported {} analyzed posts for a sub-batch of {}; using {}",
                    thread.id, parsed.analyzed, actual, actual
                );
            }
            analyzed += actual;
            flagged += parsed.flagged.min(actual);
        }

        Ok(AntisemitismStats::new(analyzed, flagged))
    }

    async fn headline(&self, thread: &Thread) -> Result<HeadlineReply> {
        let reply = self
            .llm
            .complete(HEADLINE_SYSTEM, &headline_prompt(thread), self.config.temperature)
            .await?;
        let parsed: HeadlineReply = parse_json_reply(&reply)?;
        Ok(parsed)
    }

    /// Analyze one thread: classification and headline run concurrently
    pub async fn analyze_thread(&self, thread: &Thread) -> Result<ArticleAnalysis> {
        let sample = sample_posts(thread, self.config.sample_percent);
        if sample.is_empty() {
            anyhow::bail!("thread {} has no text to analyze", thread.id);
        }

        let (stats, headline) = tokio::try_join!(self.classify(thread, &sample), self.headline(thread))?;

        Ok(ArticleAnalysis {
            thread_id: thread.id,
            headline: headline.headline.trim().to_string(),
            body: headline.body.trim().to_string(),
            reply_count: thread.reply_count,
            stats,
            source: SourceInfo {
                total_posts: thread.post_count(),
                analyzed_posts: sample.len(),
                generated_at: chrono::Utc::now().timestamp(),
            },
        })
    }

    /// Load saved progress, record `threads` as the selection and process
    /// whatever is not complete yet
    pub async fn resume(&self, threads: &[&Thread]) -> Result<Vec<ArticleAnalysis>> {
        let mut progress = self.checkpoint.load().unwrap_or_default();
        progress.thread_ids = threads.iter().map(|t| t.id).collect();
        progress.retain_selected();
        self.checkpoint.save(&progress)?;
        self.generate(threads, progress).await
    }

    /// Process every selected thread not already in `progress`
    ///
    /// The checkpoint is rewritten after each successful thread. Failed
    /// threads are logged and left out of the batch.
    pub async fn generate(&self, threads: &[&Thread], mut progress: Progress) -> Result<Vec<ArticleAnalysis>> {
        let pending: Vec<&Thread> = threads
            .iter()
            .copied()
            .filter(|t| !progress.is_completed(t.id))
            .collect();
        info!(
            "Generating articles for {} threads ({} already complete)",
            pending.len(),
            progress.completed.len()
        );

        for thread in pending {
            match self.analyze_thread(thread).await {
                Ok(article) => {
                    info!(
                        "Thread {}: {}/{} flagged ({:.1}%)",
                        thread.id, article.stats.flagged, article.stats.analyzed, article.stats.percentage
                    );
                    progress.record(article);
                    self.checkpoint
                        .save(&progress)
                        .with_context(|| format!("Failed to checkpoint after thread {}", thread.id))?;
                }
                Err(e) => warn!("Skipping thread {}: {:#}", thread.id, e),
            }
        }

        Ok(progress.completed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::models::fixtures::sized_thread;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers classification with a fixed (possibly wrong) analyzed count
    struct FakeLlm {
        reported_analyzed: Option<u32>,
        flagged: u32,
        fail_thread: Option<u64>,
        classify_calls: Mutex<Vec<usize>>,
    }

    impl FakeLlm {
        fn new(flagged: u32) -> Self {
            Self {
                reported_analyzed: None,
                flagged,
                fail_thread: None,
                classify_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn complete(&self, system: &str, user: &str, _t: f32) -> Result<String, LlmError> {
            if let Some(id) = self.fail_thread {
                if user.starts_with(&format!("Thread {}", id)) {
                    return Err(LlmError::Status {
                        code: 400,
                        body: "bad".into(),
                    });
                }
            }
            if system == CLASSIFY_SYSTEM {
                let size = user.matches("\n[").count();
                self.classify_calls.lock().unwrap().push(size);
                let analyzed = self.reported_analyzed.unwrap_or(size as u32);
                Ok(format!(r#"{{"analyzed": {}, "flagged": {}}}"#, analyzed, self.flagged))
            } else {
                Ok(r#"```json
{"headline": " A headline ", "body": "Some body."}
```"#
                    .to_string())
            }
        }
    }

    fn config(sample_percent: u32, sub_batch_size: usize) -> SummarizerConfig {
        SummarizerConfig {
            sample_percent,
            sub_batch_size,
            ..SummarizerConfig::default()
        }
    }

    #[test]
    fn test_stats_percentage() {
        assert_eq!(AntisemitismStats::new(0, 0).percentage, 0.0);
        assert_eq!(AntisemitismStats::new(20, 5).percentage, 25.0);
        assert_eq!(AntisemitismStats::new(4, 9).flagged, 4);
    }

    #[test]
    fn test_sample_size() {
        // 99 replies + root = 100 posts
        let thread = sized_thread(1, 99);
        assert_eq!(sample_posts(&thread, 30).len(), 30);
        assert_eq!(sample_posts(&thread, 0).len(), 1);
        assert_eq!(sample_posts(&thread, 100).len(), 100);
    }

    #[tokio::test]
    async fn test_sub_batches_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(FakeLlm::new(1));
        let generator = ArticleGenerator::new(
            llm.clone(),
            Checkpoint::new(dir.path().join("p.json")),
            config(100, 4),
        );
        let thread = sized_thread(7, 9);

        let article = generator.analyze_thread(&thread).await.unwrap();
        assert_eq!(*llm.classify_calls.lock().unwrap(), vec![4, 4, 2]);
        assert_eq!(article.stats.analyzed, 10);
        assert_eq!(article.stats.flagged, 3);
        assert_eq!(article.stats.percentage, 30.0);
        assert_eq!(article.headline, "A headline");
        assert_eq!(article.reply_count, 9);
        assert_eq!(article.source.total_posts, 10);
    }

    #[tokio::test]
    async fn test_mismatched_analyzed_count_is_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let mut llm = FakeLlm::new(50);
        llm.reported_analyzed = Some(500);
        let generator = ArticleGenerator::new(Arc::new(llm), Checkpoint::new(dir.path().join("p.json")), config(100, 50));

        let article = generator.analyze_thread(&sized_thread(3, 19)).await.unwrap();
        assert_eq!(article.stats.analyzed, 20);
        assert_eq!(article.stats.flagged, 20);
    }

    #[tokio::test]
    async fn test_failed_thread_is_skipped_and_progress_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("p.json"));
        let mut llm = FakeLlm::new(0);
        llm.fail_thread = Some(2);
        let generator = ArticleGenerator::new(Arc::new(llm), checkpoint.clone(), config(30, 50));

        let threads = [sized_thread(1, 10), sized_thread(2, 10), sized_thread(3, 10)];
        let refs: Vec<&Thread> = threads.iter().collect();
        let articles = generator.generate(&refs, Progress::new(vec![1, 2, 3])).await.unwrap();

        assert_eq!(articles.iter().map(|a| a.thread_id).collect::<Vec<_>>(), vec![1, 3]);
        let saved = checkpoint.load().unwrap();
        assert_eq!(saved.completed.len(), 2);
        assert_eq!(saved.pending(), vec![2]);
    }

    #[tokio::test]
    async fn test_resume_processes_only_pending_threads() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("p.json"));
        let mut progress = Progress::new(vec![1, 2, 3, 4]);
        progress.record(testing::analysis(1, 10));
        progress.record(testing::analysis(2, 10));
        checkpoint.save(&progress).unwrap();

        let llm = Arc::new(FakeLlm::new(0));
        let generator = ArticleGenerator::new(llm.clone(), checkpoint.clone(), config(30, 50));
        let threads: Vec<Thread> = (1..=4).map(|id| sized_thread(id, 10)).collect();
        let refs: Vec<&Thread> = threads.iter().collect();

        let articles = generator.resume(&refs).await.unwrap();
        assert_eq!(llm.classify_calls.lock().unwrap().len(), 2);
        assert_eq!(articles.iter().map(|a| a.thread_id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(articles[0].headline, "Headline 1");
        assert_eq!(checkpoint.load().unwrap().completed.len(), 4);
    }
}
