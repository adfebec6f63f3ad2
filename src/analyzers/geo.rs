//! Geographic participation tracker
//!
//! A point-in-time snapshot: every run recomputes from the supplied batch
//! and replaces whatever was stored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits};
use super::Analyzer;
use crate::models::Thread;

pub const NAME: &str = "geography";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoRank {
    MostCommon,
    Rarest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    #[serde(flatten)]
    pub meta: ResultMeta,
    pub rank: GeoRank,
    pub country_code: String,
    pub country_name: Option<String>,
    pub post_count: u32,
    pub unique_posters: u32,
}

impl AnalyzerRecord for GeoRecord {
    fn meta(&self) -> &ResultMeta {
        &self.meta
    }
}

pub struct GeoAnalyzer {
    store: ResultStore<GeoRecord>,
    top: usize,
}

impl GeoAnalyzer {
    pub fn new(root: &Path, limits: StorageLimits, top: usize) -> Self {
        Self {
            store: ResultStore::new(NAME, root, limits),
            top,
        }
    }
}

#[derive(Default)]
struct CountryStats {
    name: Option<String>,
    posts: u32,
    posters: HashSet<String>,
    /// First post seen from this country
    source: (u64, u64),
}

impl Analyzer for GeoAnalyzer {
    type Record = GeoRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn store(&self) -> &ResultStore<GeoRecord> {
        &self.store
    }

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<GeoRecord>> {
        let now = chrono::Utc::now().timestamp();
        let mut countries: HashMap<String, CountryStats> = HashMap::new();
        let mut total_posts = 0u32;

        for thread in threads {
            for post in thread.all_posts() {
                let Some(code) = post.country.as_deref().filter(|c| !c.is_empty()) else {
                    continue;
                };
                total_posts += 1;

                let stats = countries.entry(code.to_string()).or_insert_with(|| CountryStats {
                    source: (thread.id, post.id),
                    ..Default::default()
                });
                stats.posts += 1;
                if stats.name.is_none() {
                    stats.name = post.country_name.clone();
                }
                // Fall back to thread-scoped post id when the board hides poster ids
                let poster = post
                    .poster_id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", thread.id, post.id));
                stats.posters.insert(poster);
            }
        }

        let mut ranked: Vec<(String, CountryStats)> = countries.into_iter().collect();
        ranked.sort_by(|a, b| b.1.posts.cmp(&a.1.posts).then_with(|| a.0.cmp(&b.0)));
        let country_total = ranked.len();

        let record = |rank: GeoRank, code: &str, stats: &CountryStats| GeoRecord {
            meta: ResultMeta::new(now, stats.source.0, stats.source.1)
                .with("countries_seen", country_total)
                .with("posts_with_country", total_posts),
            rank,
            country_code: code.to_string(),
            country_name: stats.name.clone(),
            post_count: stats.posts,
            unique_posters: stats.posters.len() as u32,
        };

        let mut records: Vec<GeoRecord> = ranked
            .iter()
            .take(self.top)
            .map(|(code, stats)| record(GeoRank::MostCommon, code, stats))
            .collect();
        records.extend(
            ranked
                .iter()
                .rev()
                .take(self.top)
                .map(|(code, stats)| record(GeoRank::Rarest, code, stats)),
        );

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::storage::testing::limits;
    use crate::models::fixtures::{post, thread};
    use crate::models::Post;

    fn from(id: u64, country: &str, poster: &str) -> Post {
        let mut p = post(id, "text");
        p.country = Some(country.to_string());
        p.country_name = Some(format!("Country {}", country));
        p.poster_id = Some(poster.to_string());
        p
    }

    #[test]
    fn test_common_and_rare_from_same_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = GeoAnalyzer::new(dir.path(), limits(1_000_000), 2);
        let mut t = thread(
            1,
            "op",
            vec![
                from(2, "US", "a"),
                from(3, "US", "a"),
                from(4, "US", "b"),
                from(5, "DE", "c"),
                from(6, "DE", "c"),
                from(7, "FI", "d"),
            ],
        );
        t.country = Some("FI".into());
        t.poster_id = Some("op".into());

        let records = analyzer.analyze(&[t]).unwrap();
        let common: Vec<(&str, u32, u32)> = records
            .iter()
            .filter(|r| r.rank == GeoRank::MostCommon)
            .map(|r| (r.country_code.as_str(), r.post_count, r.unique_posters))
            .collect();
        let rare: Vec<&str> = records
            .iter()
            .filter(|r| r.rank == GeoRank::Rarest)
            .map(|r| r.country_code.as_str())
            .collect();

        assert_eq!(common, vec![("US", 3, 2), ("DE", 2, 1)]);
        assert_eq!(rare, vec!["FI", "DE"]);
    }

    #[test]
    fn test_runs_replace_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = GeoAnalyzer::new(dir.path(), limits(1_000_000), 5);

        let fresh = analyzer
            .analyze(&[thread(1, "op", vec![from(2, "US", "a")])])
            .unwrap();
        analyzer.save_results(fresh).unwrap();
        let fresh = analyzer
            .analyze(&[thread(9, "op", vec![from(10, "BR", "z")])])
            .unwrap();
        analyzer.save_results(fresh).unwrap();

        let stored = analyzer.load_results().unwrap();
        assert!(stored.iter().all(|r| r.country_code == "BR"));
        assert_eq!(stored.len(), 2);
    }
}
