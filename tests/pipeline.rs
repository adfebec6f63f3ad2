//! End-to-end pipeline scenarios against mock collaborators

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use board_watch::analyzers::{Registry, StoreView};
use board_watch::config::{
    AnalyzerConfig, HarvesterConfig, RetentionConfig, SelectorConfig, StorageConfig, SummarizerConfig,
};
use board_watch::models::{Media, Post, Thread};
use board_watch::summarizer::articles::{SourceInfo, CLASSIFY_SYSTEM, HEADLINE_SYSTEM};
use board_watch::summarizer::{AntisemitismStats, ArticleAnalysis, Checkpoint, Progress};
use board_watch::{
    BoardClient, BoardError, Harvester, LlmClient, LlmError, Maintenance, Summarizer, ThreadStore, ThreadStub,
};

fn make_thread(id: u64, replies: u32) -> Thread {
    let posts = (1..=replies as u64)
        .map(|n| Post {
            id: id * 1000 + n,
            parent: id,
            time: 1_700_000_000,
            body: Some(format!("reply {} in thread {}", n, id)),
            country: Some("NL".to_string()),
            country_name: Some("Netherlands".to_string()),
            media: None,
            tripcode: None,
            poster_id: Some(format!("poster{}", n)),
        })
        .collect();
    Thread {
        id,
        created_at: 1_700_000_000,
        subject: Some(format!("thread {}", id)),
        comment: Some("opening post".to_string()),
        reply_count: replies,
        image_count: 0,
        media: None,
        country: None,
        country_name: None,
        tripcode: None,
        poster_id: None,
        posts,
    }
}

fn storage(dir: &Path) -> StorageConfig {
    StorageConfig {
        data_dir: dir.to_path_buf(),
    }
}

struct CatalogBoard {
    catalog: Vec<ThreadStub>,
    pruned: HashSet<u64>,
    fetched: Mutex<Vec<u64>>,
}

#[async_trait]
impl BoardClient for CatalogBoard {
    async fn get_catalog(&self) -> Result<Vec<ThreadStub>, BoardError> {
        Ok(self.catalog.clone())
    }

    async fn get_thread(&self, thread_id: u64) -> Result<Thread, BoardError> {
        self.fetched.lock().unwrap().push(thread_id);
        if self.pruned.contains(&thread_id) {
            return Err(BoardError::NotFound(thread_id));
        }
        Ok(make_thread(thread_id, 2))
    }

    async fn fetch_media(&self, _media: &Media) -> Result<Vec<u8>, BoardError> {
        Err(BoardError::Http(500))
    }
}

#[tokio::test]
async fn test_harvest_hands_fetched_batch_to_analyzers() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage(dir.path());

    // Ids 1-10 are the busiest, 21-40 the newest: 30 distinct candidates
    let catalog = (1..=40u64)
        .map(|id| ThreadStub {
            id,
            replies: if id <= 10 { 1000 - id as u32 } else { id as u32 },
            images: 0,
            sticky: false,
            closed: false,
            last_modified: 0,
        })
        .collect();
    let board = Arc::new(CatalogBoard {
        catalog,
        pruned: [5, 25].into_iter().collect(),
        fetched: Mutex::new(Vec::new()),
    });

    let analyzer_config = AnalyzerConfig {
        min_free_bytes: 0,
        ..AnalyzerConfig::default()
    };
    let mut registry = Registry::with_defaults(&storage.analyzers_dir(), &analyzer_config).unwrap();
    registry.initialize();

    let harvester = Harvester::new(
        board.clone(),
        ThreadStore::new(storage.threads_dir()),
        registry,
        Maintenance::new(&storage, RetentionConfig::default()),
        storage.media_dir(),
        HarvesterConfig {
            courtesy_delay_min_ms: 0,
            courtesy_delay_max_ms: 0,
            rate_limit_backoff_min_ms: 0,
            rate_limit_backoff_max_ms: 0,
            ..HarvesterConfig::default()
        },
    );

    let stats = harvester.harvest().await.unwrap();
    assert_eq!(stats.candidates, 30);
    assert_eq!(stats.fetched, 28);
    assert_eq!(stats.not_found, 2);
    assert_eq!(stats.analyzers_succeeded, 5);

    let fetched = board.fetched.lock().unwrap().clone();
    assert_eq!(fetched.len(), 30);
    assert!(fetched.windows(2).all(|w| w[0] > w[1]));

    let stored = ThreadStore::new(storage.threads_dir()).load_all().unwrap();
    assert_eq!(stored.len(), 28);

    // Three posts per thread reached the term tracker
    let registry = Registry::with_defaults(&storage.analyzers_dir(), &analyzer_config).unwrap();
    let terms = registry.get("tracked_terms").unwrap();
    match terms.view_json().unwrap() {
        StoreView::Results { results, .. } => {
            assert_eq!(results.len(), analyzer_config.tracked_terms.len());
            assert_eq!(results[0]["metadata"]["posts_scanned"], 84);
        }
        StoreView::NoResults => panic!("term tracker stored nothing"),
    }
}

/// Answers every prompt and records which threads got a headline request
#[derive(Default)]
struct ScriptedLlm {
    headlines: Mutex<Vec<u64>>,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, system: &str, user: &str, _temperature: f32) -> Result<String, LlmError> {
        if system == CLASSIFY_SYSTEM {
            return Ok(r#"{"analyzed": 10, "flagged": 1}"#.to_string());
        }
        if system == HEADLINE_SYSTEM {
            let id: u64 = user
                .lines()
                .next()
                .and_then(|line| line.strip_prefix("Thread "))
                .and_then(|id| id.parse().ok())
                .unwrap_or_default();
            self.headlines.lock().unwrap().push(id);
            return Ok(format!(r#"{{"headline": "About {}", "body": "Discussion."}}"#, id));
        }
        if system.contains("JSON array") {
            return Ok(r#"["alpha", "beta", "gamma", "delta", "epsilon"]"#.to_string());
        }
        Ok("An overview.".to_string())
    }
}

fn finished(thread_id: u64) -> ArticleAnalysis {
    ArticleAnalysis {
        thread_id,
        headline: format!("Earlier {}", thread_id),
        body: "Done before the interruption.".to_string(),
        reply_count: 60,
        stats: AntisemitismStats::new(18, 3),
        source: SourceInfo {
            total_posts: 61,
            analyzed_posts: 18,
            generated_at: 1_700_000_000,
        },
    }
}

#[tokio::test]
async fn test_summarizer_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage(dir.path());
    let store = ThreadStore::new(storage.threads_dir());
    let (a, b, c, d) = (101, 102, 103, 104);
    for id in [a, b, c, d] {
        store.save(&make_thread(id, 60)).unwrap();
    }

    let mut progress = Progress::new(vec![a, b, c, d]);
    progress.record(finished(a));
    progress.record(finished(b));
    Checkpoint::new(storage.progress_path()).save(&progress).unwrap();

    let llm = Arc::new(ScriptedLlm::default());
    let summarizer = Summarizer::new(
        llm.clone(),
        &storage,
        &SelectorConfig { required: 4 },
        &SummarizerConfig::default(),
    );
    let summary = summarizer.summarize().await.unwrap();

    assert_eq!(*llm.headlines.lock().unwrap(), vec![c, d]);

    let ids: Vec<u64> = summary.batch.articles.iter().map(|a| a.thread_id).collect();
    assert_eq!(ids, vec![a, b, c, d]);
    assert_eq!(summary.batch.articles[0].headline, "Earlier 101");
    assert_eq!(summary.batch.articles[2].headline, "About 103");
    assert_eq!(summary.matrix.themes.len(), 5);
    assert_eq!(summary.overview.sentiments.len(), 5);

    assert!(storage.summary_path().exists());
    assert!(!storage.progress_path().exists());
}
