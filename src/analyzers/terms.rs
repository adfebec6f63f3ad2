//! Tracked-term frequency tracker
//!
//! Each run appends one row per term to the stored history; the previous
//! count for a term is the newest stored row for it.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use super::storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits};
use super::{batch_source, Analyzer};
use crate::extractor::term_pattern;
use crate::models::Thread;

pub const NAME: &str = "tracked_terms";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermRecord {
    #[serde(flatten)]
    pub meta: ResultMeta,
    pub term: String,
    pub count: u32,
    pub previous_count: u32,
    pub percent_change: f64,
}

impl AnalyzerRecord for TermRecord {
    fn meta(&self) -> &ResultMeta {
        &self.meta
    }
}

/// Relative change from `previous` to `current` in percent
///
/// Growth from zero counts as +100; zero to zero is no change.
pub fn percent_change(previous: u32, current: u32) -> f64 {
    match (previous, current) {
        (0, 0) => 0.0,
        (0, _) => 100.0,
        (p, c) => (c as f64 - p as f64) / p as f64 * 100.0,
    }
}

pub struct TermAnalyzer {
    store: ResultStore<TermRecord>,
    terms: Vec<(String, Regex)>,
}

impl TermAnalyzer {
    pub fn new(root: &Path, limits: StorageLimits, terms: &[String]) -> Self {
        let terms = terms
            .iter()
            .filter_map(|term| {
                let term = term.trim().to_lowercase();
                match term_pattern(&term) {
                    Some(pattern) if !term.is_empty() => Some((term, pattern)),
                    _ => {
                        warn!("Ignoring unusable tracked term '{}'", term);
                        None
                    }
                }
            })
            .collect();

        Self {
            store: ResultStore::new(NAME, root, limits),
            terms,
        }
    }

    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(term, _)| term.as_str())
    }

    /// Newest stored count per term
    fn previous_counts(&self) -> Result<HashMap<String, u32>> {
        let mut latest: HashMap<String, (i64, u32)> = HashMap::new();
        for record in self.load_results()? {
            let entry = latest
                .entry(record.term.clone())
                .or_insert((record.meta.generated_at, record.count));
            if record.meta.generated_at >= entry.0 {
                *entry = (record.meta.generated_at, record.count);
            }
        }
        Ok(latest.into_iter().map(|(term, (_, count))| (term, count)).collect())
    }
}

impl Analyzer for TermAnalyzer {
    type Record = TermRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn store(&self) -> &ResultStore<TermRecord> {
        &self.store
    }

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<TermRecord>> {
        let now = chrono::Utc::now().timestamp();
        let previous = self.previous_counts()?;
        let mut counts = vec![0u32; self.terms.len()];
        let mut posts_scanned = 0u32;
        let mut posts_with_terms = 0u32;

        for thread in threads {
            for post in thread.all_posts() {
                posts_scanned += 1;
                let body = post.body_text();
                let mut hit = false;
                for (slot, (_, pattern)) in counts.iter_mut().zip(&self.terms) {
                    let found = pattern.find_iter(body).count() as u32;
                    if found > 0 {
                        *slot += found;
                        hit = true;
                    }
                }
                if hit {
                    posts_with_terms += 1;
                }
            }
        }

        let total: u32 = counts.iter().sum();
        let (thread_id, post_id) = batch_source(threads);

        let records = self
            .terms
            .iter()
            .zip(counts)
            .map(|((term, _), count)| {
                let previous_count = previous.get(term).copied().unwrap_or(0);
                TermRecord {
                    meta: ResultMeta::new(now, thread_id, post_id)
                        .with("posts_scanned", posts_scanned)
                        .with("posts_with_terms", posts_with_terms)
                        .with("total_occurrences", total),
                    term: term.clone(),
                    count,
                    previous_count,
                    percent_change: percent_change(previous_count, count),
                }
            })
            .collect();

        Ok(records)
    }

    fn merge(&self, mut previous: Vec<TermRecord>, fresh: Vec<TermRecord>) -> Vec<TermRecord> {
        previous.extend(fresh);
        previous
    }
}
