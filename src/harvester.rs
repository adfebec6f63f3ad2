//! Thread harvester
//!
//! One harvest run: read the catalog, pick the busiest and the newest
//! threads, fetch each one sequentially with a courtesy delay, persist the
//! snapshots, then hand the whole batch to the analyzer registry and apply
//! retention.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::analyzers::Registry;
use crate::client::{BoardClient, ThreadStub};
use crate::config::HarvesterConfig;
use crate::error::{BoardError, PipelineError};
use crate::maintenance::Maintenance;
use crate::models::Thread;
use crate::scheduler::Job;
use crate::store::{write_bytes_atomic, ThreadStore};

/// Statistics from a harvest run
#[derive(Debug, Default)]
pub struct HarvestStats {
    pub candidates: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub media_downloaded: usize,
    pub media_failed: usize,
    pub analyzers_succeeded: usize,
    pub analyzers_failed: usize,
    pub threads_swept: u64,
}

/// Union of the top threads by reply count and the newest threads by id,
/// skipping pinned and locked threads, newest first
pub fn select_candidates(catalog: &[ThreadStub], top_by_replies: usize, newest: usize) -> Vec<u64> {
    let mut open: Vec<&ThreadStub> = catalog.iter().filter(|t| !t.sticky && !t.closed).collect();

    open.sort_by(|a, b| b.replies.cmp(&a.replies).then_with(|| b.id.cmp(&a.id)));
    let mut ids: BTreeSet<u64> = open.iter().take(top_by_replies).map(|t| t.id).collect();

    open.sort_by(|a, b| b.id.cmp(&a.id));
    ids.extend(open.iter().take(newest).map(|t| t.id));

    ids.into_iter().rev().collect()
}

fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

pub struct Harvester {
    client: Arc<dyn BoardClient>,
    store: ThreadStore,
    registry: Mutex<Registry>,
    maintenance: Maintenance,
    media_dir: PathBuf,
    config: HarvesterConfig,
}

impl Harvester {
    pub fn new(
        client: Arc<dyn BoardClient>,
        store: ThreadStore,
        registry: Registry,
        maintenance: Maintenance,
        media_dir: PathBuf,
        config: HarvesterConfig,
    ) -> Self {
        Self {
            client,
            store,
            registry: Mutex::new(registry),
            maintenance,
            media_dir,
            config,
        }
    }

    /// Run `op`, backing off and retrying the same request while rate limited
    async fn with_backoff<T, F, Fut>(&self, what: &str, stats: &mut HarvestStats, mut op: F) -> Result<T, BoardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoardError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Err(BoardError::RateLimited) if retries < self.config.max_rate_limit_retries => {
                    retries += 1;
                    stats.rate_limited += 1;
                    let delay = random_delay(
                        self.config.rate_limit_backoff_min_ms,
                        self.config.rate_limit_backoff_max_ms,
                    );
                    warn!(
                        "Rate limited fetching {} (retry {}/{}), backing off {:?}",
                        what, retries, self.config.max_rate_limit_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn courtesy_pause(&self) {
        let delay = random_delay(self.config.courtesy_delay_min_ms, self.config.courtesy_delay_max_ms);
        if !delay.is_zero() {
            debug!("Courtesy delay {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Download the thread's lead media; failures are logged, never fatal
    async fn download_media(&self, thread: &Thread, stats: &mut HarvestStats) {
        let Some(media) = &thread.media else {
            return;
        };
        if media.is_video() {
            debug!("Skipping video media {} for thread {}", media.file_name(), thread.id);
            return;
        }
        let path = self.media_dir.join(media.file_name());
        if path.exists() {
            return;
        }

        let result = async {
            let bytes = self
                .with_backoff("media", stats, || self.client.fetch_media(media))
                .await?;
            write_bytes_atomic(&path, &bytes)
        }
        .await;

        match result {
            Ok(()) => stats.media_downloaded += 1,
            Err(e) => {
                stats.media_failed += 1;
                warn!("Failed to download media for thread {}: {:#}", thread.id, e);
            }
        }
    }

    /// One full harvest pass
    pub async fn harvest(&self) -> Result<HarvestStats> {
        let mut stats = HarvestStats::default();

        let catalog = self
            .with_backoff("catalog", &mut stats, || self.client.get_catalog())
            .await
            .context("Catalog fetch failed")?;
        let candidates = select_candidates(&catalog, self.config.top_by_replies, self.config.newest);
        stats.candidates = candidates.len();
        info!("Harvesting {} of {} catalog threads", candidates.len(), catalog.len());

        let mut batch = Vec::with_capacity(candidates.len());
        for (i, &thread_id) in candidates.iter().enumerate() {
            if i > 0 {
                self.courtesy_pause().await;
            }

            let fetched = self
                .with_backoff("thread", &mut stats, || self.client.get_thread(thread_id))
                .await;
            let thread = match fetched {
                Ok(thread) => thread,
                Err(BoardError::NotFound(_)) => {
                    debug!("Thread {} was pruned, skipping", thread_id);
                    stats.not_found += 1;
                    continue;
                }
                Err(e @ BoardError::RateLimited) => {
                    return Err(e).context(format!("Gave up on thread {} after repeated rate limiting", thread_id));
                }
                Err(e) => {
                    warn!("Failed to fetch thread {}: {}", thread_id, e);
                    stats.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.store.save(&thread) {
                if matches!(
                    e.downcast_ref::<PipelineError>(),
                    Some(PipelineError::InsufficientDiskSpace { .. })
                ) {
                    return Err(e);
                }
                warn!("Failed to store thread {}: {:#}", thread_id, e);
                stats.failed += 1;
                continue;
            }
            if self.config.download_media {
                self.download_media(&thread, &mut stats).await;
            }
            stats.fetched += 1;
            batch.push(thread);
        }

        let mut registry = self.registry.lock().await;
        if batch.is_empty() {
            warn!("Harvest produced no threads; skipping analysis");
        } else {
            let outcome = registry.analyze_threads(&batch)?;
            stats.analyzers_succeeded = outcome.succeeded.len();
            stats.analyzers_failed = outcome.failed.len();
        }

        if let Err(e) = registry.purge_old_results() {
            warn!("Analyzer retention purge failed: {:#}", e);
        }
        drop(registry);

        match self.maintenance.sweep_threads() {
            Ok(swept) => stats.threads_swept = swept.threads_deleted,
            Err(e) => warn!("Thread retention sweep failed: {:#}", e),
        }

        info!(
            "Harvest complete: {} fetched, {} not found, {} failed, {} analyzers ok",
            stats.fetched, stats.not_found, stats.failed, stats.analyzers_succeeded
        );
        Ok(stats)
    }
}

#[async_trait]
impl Job for Harvester {
    async fn run(&self) -> Result<()> {
        self.harvest().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerConfig, RetentionConfig, StorageConfig};
    use crate::models::fixtures::sized_thread;
    use crate::models::Media;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;

    fn stub(id: u64, replies: u32) -> ThreadStub {
        ThreadStub {
            id,
            replies,
            images: 0,
            sticky: false,
            closed: false,
            last_modified: 0,
        }
    }

    #[derive(Default)]
    struct MockBoard {
        catalog: Vec<ThreadStub>,
        missing: HashSet<u64>,
        /// Rate-limit responses queued before real answers
        throttled: StdMutex<VecDeque<u64>>,
        requests: StdMutex<Vec<u64>>,
    }

    #[async_trait]
    impl BoardClient for MockBoard {
        async fn get_catalog(&self) -> Result<Vec<ThreadStub>, BoardError> {
            Ok(self.catalog.clone())
        }

        async fn get_thread(&self, thread_id: u64) -> Result<Thread, BoardError> {
            self.requests.lock().unwrap().push(thread_id);
            let mut throttled = self.throttled.lock().unwrap();
            if throttled.front() == Some(&thread_id) {
                throttled.pop_front();
                return Err(BoardError::RateLimited);
            }
            if self.missing.contains(&thread_id) {
                return Err(BoardError::NotFound(thread_id));
            }
            let mut thread = sized_thread(thread_id, 3);
            thread.media = Some(Media {
                file_id: thread_id as i64,
                extension: if thread_id % 2 == 0 { ".png".into() } else { ".webm".into() },
                filename: None,
                width: None,
                height: None,
                md5: None,
            });
            Ok(thread)
        }

        async fn fetch_media(&self, _media: &Media) -> Result<Vec<u8>, BoardError> {
            Ok(vec![1, 2, 3])
        }
    }

    fn quick_config() -> HarvesterConfig {
        HarvesterConfig {
            courtesy_delay_min_ms: 0,
            courtesy_delay_max_ms: 0,
            rate_limit_backoff_min_ms: 0,
            rate_limit_backoff_max_ms: 0,
            max_rate_limit_retries: 2,
            download_media: true,
            ..HarvesterConfig::default()
        }
    }

    fn harvester(dir: &std::path::Path, board: Arc<MockBoard>) -> Harvester {
        let storage = StorageConfig {
            data_dir: dir.to_path_buf(),
        };
        let analyzers = AnalyzerConfig {
            min_free_bytes: 0,
            ..AnalyzerConfig::default()
        };
        let registry = Registry::with_defaults(&storage.analyzers_dir(), &analyzers).unwrap();
        Harvester::new(
            board,
            ThreadStore::new(storage.threads_dir()),
            registry,
            Maintenance::new(&storage, RetentionConfig::default()),
            storage.media_dir(),
            quick_config(),
        )
    }

    #[test]
    fn test_candidates_union_newest_first() {
        let catalog = vec![stub(1, 300), stub(2, 250), stub(3, 5), stub(4, 1), stub(5, 0)];
        assert_eq!(select_candidates(&catalog, 2, 2), vec![5, 4, 2, 1]);
        assert_eq!(select_candidates(&catalog, 3, 3), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_candidates_skip_pinned_and_locked() {
        let mut catalog = vec![stub(1, 900), stub(2, 10), stub(3, 5)];
        catalog[0].sticky = true;
        catalog[2].closed = true;
        assert_eq!(select_candidates(&catalog, 5, 5), vec![2]);
    }

    #[tokio::test]
    async fn test_harvest_skips_pruned_and_retries_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(MockBoard {
            catalog: (1..=6).map(|id| stub(id, id as u32 * 10)).collect(),
            missing: [2].into_iter().collect(),
            throttled: StdMutex::new([4].into_iter().collect()),
            ..MockBoard::default()
        });
        let harvester = harvester(dir.path(), board.clone());

        let stats = harvester.harvest().await.unwrap();
        assert_eq!(stats.candidates, 6);
        assert_eq!(stats.fetched, 5);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.analyzers_succeeded, 5);

        let requests = board.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![6, 5, 4, 4, 3, 2, 1]);

        let stored = ThreadStore::new(dir.path().join("threads")).load_all().unwrap();
        assert_eq!(stored.iter().map(|t| t.id).collect::<Vec<_>>(), vec![6, 5, 4, 3, 1]);

        // Even ids carry images, odd ids carry video that is never fetched
        assert_eq!(stats.media_downloaded, 2);
        assert!(dir.path().join("media").join("6.png").exists());
        assert!(!dir.path().join("media").join("5.webm").exists());
    }

    #[tokio::test]
    async fn test_unwritable_snapshot_skips_only_that_thread() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the snapshot path makes the rename fail
        let blocked = dir.path().join("threads").join("2.json");
        std::fs::create_dir_all(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();

        let board = Arc::new(MockBoard {
            catalog: (1..=3).map(|id| stub(id, id as u32)).collect(),
            ..MockBoard::default()
        });
        let harvester = harvester(dir.path(), board.clone());

        let stats = harvester.harvest().await.unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.analyzers_succeeded, 5);
        assert_eq!(board.requests.lock().unwrap().clone(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(MockBoard {
            catalog: vec![stub(1, 1)],
            throttled: StdMutex::new([1, 1, 1, 1].into_iter().collect()),
            ..MockBoard::default()
        });
        let harvester = harvester(dir.path(), board.clone());

        assert!(harvester.harvest().await.is_err());
        assert_eq!(board.requests.lock().unwrap().len(), 3);
    }
}
