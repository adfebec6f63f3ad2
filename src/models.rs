//! Harvested thread and post snapshots

use serde::{Deserialize, Serialize};

/// Lead media attached to a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// Server-side file stem (`tim` in the board API)
    pub file_id: i64,
    pub extension: String,
    pub filename: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub md5: Option<String>,
}

impl Media {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.file_id, self.extension)
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self.extension.to_ascii_lowercase().as_str(),
            ".webm" | ".mp4" | ".mov" | ".mkv"
        )
    }
}

/// A single message within a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    /// Parent post reference, 0 for the root post
    #[serde(default)]
    pub parent: u64,
    pub time: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_name: Option<String>,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(default)]
    pub tripcode: Option<String>,
    #[serde(default)]
    pub poster_id: Option<String>,
}

impl Post {
    pub fn is_root(&self) -> bool {
        self.parent == 0
    }

    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

/// Root post plus replies, stored as one snapshot file per thread id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: u64,
    pub created_at: i64,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    pub reply_count: u32,
    pub image_count: u32,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_name: Option<String>,
    #[serde(default)]
    pub tripcode: Option<String>,
    #[serde(default)]
    pub poster_id: Option<String>,
    /// Replies in board order, excluding the root post
    #[serde(default)]
    pub posts: Vec<Post>,
}

impl Thread {
    /// The root post synthesized from the thread-level fields
    pub fn root_post(&self) -> Post {
        Post {
            id: self.id,
            parent: 0,
            time: self.created_at,
            body: self.comment.clone(),
            country: self.country.clone(),
            country_name: self.country_name.clone(),
            media: self.media.clone(),
            tripcode: self.tripcode.clone(),
            poster_id: self.poster_id.clone(),
        }
    }

    /// Root post followed by every reply
    pub fn all_posts(&self) -> Vec<Post> {
        let mut posts = Vec::with_capacity(self.posts.len() + 1);
        posts.push(self.root_post());
        posts.extend(self.posts.iter().cloned());
        posts
    }

    /// Number of posts including the root
    pub fn post_count(&self) -> usize {
        self.posts.len().max(self.reply_count as usize) + 1
    }

    pub fn title(&self) -> String {
        self.subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("Thread {}", self.id))
    }
}
