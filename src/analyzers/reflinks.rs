//! Reply-graph ranker: the most replied-to posts

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits};
use super::Analyzer;
use crate::extractor::{excerpt, quote_references};
use crate::models::{Post, Thread};

pub const NAME: &str = "reply_ranking";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflinkRecord {
    #[serde(flatten)]
    pub meta: ResultMeta,
    pub reply_count: u32,
    pub subject: Option<String>,
    pub excerpt: String,
    pub country: Option<String>,
}

impl AnalyzerRecord for ReflinkRecord {
    fn meta(&self) -> &ResultMeta {
        &self.meta
    }
}

pub struct ReflinkAnalyzer {
    store: ResultStore<ReflinkRecord>,
    top: usize,
}

impl ReflinkAnalyzer {
    pub fn new(root: &Path, limits: StorageLimits, top: usize) -> Self {
        Self {
            store: ResultStore::new(NAME, root, limits),
            top,
        }
    }
}

/// Distinct repliers per target post within one thread
fn count_replies(posts: &[Post]) -> HashMap<u64, u32> {
    let by_id: HashMap<u64, &Post> = posts.iter().map(|p| (p.id, p)).collect();
    let mut edges: HashSet<(u64, u64)> = HashSet::new();

    for post in posts {
        let mut targets = quote_references(post.body_text());
        if post.parent != 0 {
            targets.insert(post.parent);
        }

        for target in targets {
            if target != post.id && by_id.contains_key(&target) {
                edges.insert((target, post.id));
            }
        }
    }

    let mut counts = HashMap::new();
    for (target, _) in edges {
        *counts.entry(target).or_insert(0) += 1;
    }
    counts
}

fn rank(records: &mut Vec<ReflinkRecord>, top: usize) {
    records.sort_by(|a, b| {
        b.reply_count
            .cmp(&a.reply_count)
            .then_with(|| b.meta.post_id.cmp(&a.meta.post_id))
    });
    records.truncate(top);
}

impl Analyzer for ReflinkAnalyzer {
    type Record = ReflinkRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn store(&self) -> &ResultStore<ReflinkRecord> {
        &self.store
    }

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<ReflinkRecord>> {
        let now = chrono::Utc::now().timestamp();
        let mut records = Vec::new();

        for thread in threads {
            let posts = thread.all_posts();
            let counts = count_replies(&posts);

            for post in posts.iter().filter(|p| !p.is_root()) {
                let Some(&reply_count) = counts.get(&post.id) else {
                    continue;
                };
                records.push(ReflinkRecord {
                    meta: ResultMeta::new(now, thread.id, post.id),
                    reply_count,
                    subject: thread.subject.clone(),
                    excerpt: excerpt(post.body_text(), 280),
                    country: post.country.clone(),
                });
            }
        }

        rank(&mut records, self.top);
        Ok(records)
    }

    /// Re-rank fresh results together with the stored top N
    fn merge(&self, previous: Vec<ReflinkRecord>, fresh: Vec<ReflinkRecord>) -> Vec<ReflinkRecord> {
        let mut by_post: HashMap<(u64, u64), ReflinkRecord> = HashMap::new();
        for record in previous.into_iter().chain(fresh) {
            let key = (record.meta.thread_id, record.meta.post_id);
            match by_post.get(&key) {
                Some(existing) if existing.reply_count > record.reply_count => {}
                _ => {
                    by_post.insert(key, record);
                }
            }
        }

        let mut merged: Vec<ReflinkRecord> = by_post.into_values().collect();
        rank(&mut merged, self.top);
        merged
    }
}
