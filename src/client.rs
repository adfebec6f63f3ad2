//! Board API client
//!
//! Talks to the 4chan-style read-only JSON API: one catalog request lists
//! every live thread, one thread request returns the root post and all
//! replies. Comments arrive as HTML and are flattened to plain text here so
//! everything downstream works on `>>123` references and bare URLs.

use async_trait::async_trait;
use governor::{Quota, RateLimiter as GovRateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

use crate::config::BoardConfig;
use crate::error::BoardError;
use crate::extractor::strip_html;
use crate::models::{Media, Post, Thread};

/// Catalog entry: enough to rank a thread without fetching it
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadStub {
    pub id: u64,
    pub replies: u32,
    pub images: u32,
    pub sticky: bool,
    pub closed: bool,
    pub last_modified: i64,
}

#[async_trait]
pub trait BoardClient: Send + Sync {
    async fn get_catalog(&self) -> Result<Vec<ThreadStub>, BoardError>;

    /// Root post plus replies; `NotFound` when the thread was pruned
    async fn get_thread(&self, thread_id: u64) -> Result<Thread, BoardError>;

    async fn fetch_media(&self, media: &Media) -> Result<Vec<u8>, BoardError>;
}

type DirectLimiter =
    GovRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

pub struct HttpBoardClient {
    client: Client,
    rate_limiter: DirectLimiter,
    config: BoardConfig,
}

impl HttpBoardClient {
    pub fn new(config: &BoardConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .user_agent("board-watch/0.1 (thread archive research)")
            .build()?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = GovRateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            rate_limiter,
            config: config.clone(),
        })
    }

    async fn get(&self, url: &str, thread_id: u64) -> Result<reqwest::Response, BoardError> {
        self.rate_limiter.until_ready().await;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BoardError::Transport(e.to_string()))?;

        match status_error(response.status(), thread_id) {
            Some(e) => Err(e),
            None => Ok(response),
        }
    }
}

/// Map a non-success status to the error kind callers branch on
fn status_error(status: StatusCode, thread_id: u64) -> Option<BoardError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(BoardError::RateLimited)
    } else if status == StatusCode::NOT_FOUND {
        Some(BoardError::NotFound(thread_id))
    } else {
        Some(BoardError::Http(status.as_u16()))
    }
}

#[async_trait]
impl BoardClient for HttpBoardClient {
    async fn get_catalog(&self) -> Result<Vec<ThreadStub>, BoardError> {
        let url = format!("{}/{}/catalog.json", self.config.api_base, self.config.name);
        let pages: Vec<CatalogPage> = self
            .get(&url, 0)
            .await?
            .json()
            .await
            .map_err(|e| BoardError::Decode(e.to_string()))?;
        Ok(flatten_catalog(pages))
    }

    async fn get_thread(&self, thread_id: u64) -> Result<Thread, BoardError> {
        let url = format!("{}/{}/thread/{}.json", self.config.api_base, self.config.name, thread_id);
        let body: ThreadResponse = self
            .get(&url, thread_id)
            .await?
            .json()
            .await
            .map_err(|e| BoardError::Decode(e.to_string()))?;
        body.into_thread(thread_id)
    }

    async fn fetch_media(&self, media: &Media) -> Result<Vec<u8>, BoardError> {
        let url = format!("{}/{}/{}", self.config.media_base, self.config.name, media.file_name());
        let bytes = self
            .get(&url, 0)
            .await?
            .bytes()
            .await
            .map_err(|e| BoardError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn flatten_catalog(pages: Vec<CatalogPage>) -> Vec<ThreadStub> {
    pages
        .into_iter()
        .flat_map(|page| page.threads)
        .map(|t| ThreadStub {
            id: t.no,
            replies: t.replies.unwrap_or(0),
            images: t.images.unwrap_or(0),
            sticky: t.sticky.unwrap_or(0) == 1,
            closed: t.closed.unwrap_or(0) == 1,
            last_modified: t.last_modified,
        })
        .collect()
}

// === API Response Types ===

#[derive(Debug, Deserialize)]
struct CatalogPage {
    threads: Vec<CatalogThread>,
}

#[derive(Debug, Deserialize)]
struct CatalogThread {
    no: u64,
    #[serde(default)]
    last_modified: i64,
    #[serde(default)]
    replies: Option<u32>,
    #[serde(default)]
    images: Option<u32>,
    #[serde(default)]
    sticky: Option<u8>,
    #[serde(default)]
    closed: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    posts: Vec<ApiPost>,
}

#[derive(Debug, Deserialize)]
struct ApiPost {
    no: u64,
    #[serde(default)]
    resto: u64,
    time: i64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
    #[serde(default)]
    trip: Option<String>,
    /// Per-thread poster id
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_name: Option<String>,
    /// Meme flags stand in for a country on some boards
    #[serde(default)]
    troll_country: Option<String>,
    #[serde(default)]
    replies: Option<u32>,
    #[serde(default)]
    images: Option<u32>,

    #[serde(default)]
    tim: Option<i64>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    w: Option<u32>,
    #[serde(default)]
    h: Option<u32>,
    #[serde(default)]
    md5: Option<String>,
}

impl ApiPost {
    fn media(&self) -> Option<Media> {
        let file_id = self.tim?;
        Some(Media {
            file_id,
            extension: self.ext.clone().unwrap_or_else(|| ".jpg".to_string()),
            filename: self.filename.clone(),
            width: self.w,
            height: self.h,
            md5: self.md5.clone(),
        })
    }

    fn country(&self) -> Option<String> {
        self.country.clone().or_else(|| self.troll_country.clone())
    }

    fn body(&self) -> Option<String> {
        self.com.as_deref().map(strip_html).filter(|b| !b.is_empty())
    }

    fn into_post(self) -> Post {
        Post {
            id: self.no,
            parent: self.resto,
            time: self.time,
            body: self.body(),
            country: self.country(),
            country_name: self.country_name.clone(),
            media: self.media(),
            tripcode: self.trip,
            poster_id: self.id,
        }
    }
}

impl ThreadResponse {
    fn into_thread(self, thread_id: u64) -> Result<Thread, BoardError> {
        let mut posts = self.posts.into_iter();
        let root = posts
            .next()
            .ok_or_else(|| BoardError::Decode(format!("thread {} has no posts", thread_id)))?;

        let replies: Vec<Post> = posts.map(ApiPost::into_post).collect();
        Ok(Thread {
            id: root.no,
            created_at: root.time,
            subject: root.sub.as_deref().map(strip_html).filter(|s| !s.is_empty()),
            comment: root.body(),
            reply_count: root.replies.unwrap_or(replies.len() as u32),
            image_count: root.images.unwrap_or(0),
            media: root.media(),
            country: root.country(),
            country_name: root.country_name.clone(),
            tripcode: root.trip.clone(),
            poster_id: root.id.clone(),
            posts: replies,
        })
    }
}
