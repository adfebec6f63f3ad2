//! Digit-run detector: posts whose numbers end in repeated digits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits};
use super::Analyzer;
use crate::extractor::{excerpt, mentions_checking};
use crate::models::Thread;

pub const NAME: &str = "digit_runs";

/// Taxonomy label for a run of `count` identical trailing digits
pub fn classify(count: u32) -> Option<&'static str> {
    match count {
        0 | 1 => None,
        2 => Some("dubs"),
        3 => Some("trips"),
        4 => Some("quads"),
        5 => Some("quints"),
        6 => Some("sexts"),
        7 => Some("septs"),
        8 => Some("octs"),
        _ => Some("special"),
    }
}

/// Length of the run of identical digits at the end of `number`
pub fn trailing_run(number: u64) -> u32 {
    let digits = number.to_string();
    let bytes = digits.as_bytes();
    let Some(&last) = bytes.last() else {
        return 0;
    };
    bytes.iter().rev().take_while(|&&b| b == last).count() as u32
}

/// `2^digits * 1000 + checks`, so a longer run always outranks more checks
pub fn score(digit_count: u32, check_count: u32) -> u64 {
    2u64.saturating_pow(digit_count)
        .saturating_mul(1000)
        .saturating_add(check_count as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRecord {
    #[serde(flatten)]
    pub meta: ResultMeta,
    pub digit_count: u32,
    pub label: String,
    pub check_count: u32,
    pub score: u64,
    pub subject: Option<String>,
    pub excerpt: String,
}

impl AnalyzerRecord for GetRecord {
    fn meta(&self) -> &ResultMeta {
        &self.meta
    }
}

pub struct GetAnalyzer {
    store: ResultStore<GetRecord>,
    top: usize,
}

impl GetAnalyzer {
    pub fn new(root: &Path, limits: StorageLimits, top: usize) -> Self {
        Self {
            store: ResultStore::new(NAME, root, limits),
            top,
        }
    }
}

impl Analyzer for GetAnalyzer {
    type Record = GetRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn store(&self) -> &ResultStore<GetRecord> {
        &self.store
    }

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<GetRecord>> {
        let now = chrono::Utc::now().timestamp();
        let mut records = Vec::new();

        for thread in threads {
            let posts = thread.all_posts();

            for post in &posts {
                let digit_count = trailing_run(post.id);
                let Some(label) = classify(digit_count) else {
                    continue;
                };

                let number = post.id.to_string();
                let check_count = posts
                    .iter()
                    .filter(|other| other.id != post.id)
                    .filter(|other| {
                        let body = other.body_text();
                        mentions_checking(body) && body.contains(&number)
                    })
                    .count() as u32;

                records.push(GetRecord {
                    meta: ResultMeta::new(now, thread.id, post.id),
                    digit_count,
                    label: label.to_string(),
                    check_count,
                    score: score(digit_count, check_count),
                    subject: thread.subject.clone(),
                    excerpt: excerpt(post.body_text(), 200),
                });
            }
        }

        Ok(records)
    }

    /// Keep the higher check count per post, then the top N by score
    fn merge(&self, previous: Vec<GetRecord>, fresh: Vec<GetRecord>) -> Vec<GetRecord> {
        let mut by_post: HashMap<u64, GetRecord> = HashMap::new();
        for record in previous.into_iter().chain(fresh) {
            match by_post.get(&record.meta.post_id) {
                Some(existing) if existing.check_count >= record.check_count => {}
                _ => {
                    by_post.insert(record.meta.post_id, record);
                }
            }
        }

        let mut merged: Vec<GetRecord> = by_post.into_values().collect();
        merged.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.meta.post_id.cmp(&a.meta.post_id))
        });
        merged.truncate(self.top);
        merged
    }
}
