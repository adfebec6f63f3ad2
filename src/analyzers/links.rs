//! Link and domain tracker

use anyhow::Result;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::storage::{AnalyzerRecord, ResultMeta, ResultStore, StorageLimits};
use super::Analyzer;
use crate::extractor::{excerpt, extract_urls, normalize_domain};
use crate::models::Thread;

pub const NAME: &str = "links";

/// Video hosts whose links are counted as excluded rather than tallied
const EXCLUDED_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];

/// True for an excluded host or any of its subdomains
fn is_excluded(domain: &str) -> bool {
    EXCLUDED_DOMAINS.iter().any(|host| {
        domain == *host || domain.strip_suffix(host).is_some_and(|rest| rest.ends_with('.'))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkCategory {
    News,
    Image,
    Social,
    Archive,
    Reference,
    Other,
}

impl LinkCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::News => "news",
            Self::Image => "image",
            Self::Social => "social",
            Self::Archive => "archive",
            Self::Reference => "reference",
            Self::Other => "other",
        }
    }

    /// Classify by domain substring
    pub fn of(domain: &str) -> Self {
        const ARCHIVE: &[&str] = &["archive.org", "archive.ph", "archive.is", "archive.today", "ghostarchive", "desuarchive", "4plebs", "warosu"];
        const IMAGE: &[&str] = &["imgur", "4cdn", "twimg", "catbox", "postimg", "imgbb", "gyazo", "flickr"];
        const SOCIAL: &[&str] = &["twitter.com", "x.com", "reddit", "facebook", "instagram", "tiktok", "t.me", "telegram", "bsky", "gab.com", "truthsocial", "rumble", "bitchute"];
        const REFERENCE: &[&str] = &["wikipedia", "wiki", "github", ".gov", ".edu", "britannica", "pubmed", "arxiv"];
        const NEWS: &[&str] = &["news", "reuters", "apnews", "bbc", "cnn", "nytimes", "washingtonpost", "theguardian", "foxnews", "aljazeera", "bloomberg", "politico", "nypost", "dailymail", "timesofisrael", "haaretz", "breitbart", "zerohedge"];

        let matches = |needles: &[&str]| needles.iter().any(|n| domain.contains(n));
        if matches(ARCHIVE) {
            Self::Archive
        } else if matches(IMAGE) {
            Self::Image
        } else if matches(SOCIAL) {
            Self::Social
        } else if matches(REFERENCE) {
            Self::Reference
        } else if matches(NEWS) {
            Self::News
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkEntry {
    /// One of the top domains; the source ids point at its latest occurrence
    Domain {
        domain: String,
        count: u32,
        category: LinkCategory,
    },
    /// A randomly sampled link-bearing post
    Sample {
        urls: Vec<String>,
        domains: Vec<String>,
        category: LinkCategory,
        excerpt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    #[serde(flatten)]
    pub meta: ResultMeta,
    #[serde(flatten)]
    pub entry: LinkEntry,
}

impl AnalyzerRecord for LinkRecord {
    fn meta(&self) -> &ResultMeta {
        &self.meta
    }
}

pub struct LinkAnalyzer {
    store: ResultStore<LinkRecord>,
    top_domains: usize,
    samples: usize,
}

impl LinkAnalyzer {
    pub fn new(root: &Path, limits: StorageLimits, top_domains: usize, samples: usize) -> Self {
        Self {
            store: ResultStore::new(NAME, root, limits),
            top_domains,
            samples,
        }
    }
}

struct DomainTally {
    count: u32,
    latest: (u64, u64, i64),
}

impl Analyzer for LinkAnalyzer {
    type Record = LinkRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn store(&self) -> &ResultStore<LinkRecord> {
        &self.store
    }

    fn analyze(&mut self, threads: &[Thread]) -> Result<Vec<LinkRecord>> {
        let now = chrono::Utc::now().timestamp();
        let mut tallies: HashMap<String, DomainTally> = HashMap::new();
        let mut categories: BTreeMap<LinkCategory, u32> = BTreeMap::new();
        let mut candidates = Vec::new();
        let mut total_links = 0u32;
        let mut excluded_links = 0u32;
        let mut root_links = 0u32;

        for thread in threads {
            if let Some(comment) = &thread.comment {
                root_links += extract_urls(comment).len() as u32;
            }

            for post in &thread.posts {
                let urls = extract_urls(post.body_text());
                if urls.is_empty() {
                    continue;
                }

                let mut kept_urls = Vec::new();
                let mut domains = Vec::new();
                for url in urls {
                    total_links += 1;
                    let Some(domain) = normalize_domain(&url) else {
                        continue;
                    };
                    if is_excluded(&domain) {
                        excluded_links += 1;
                        continue;
                    }

                    *categories.entry(LinkCategory::of(&domain)).or_insert(0) += 1;
                    let tally = tallies.entry(domain.clone()).or_insert(DomainTally {
                        count: 0,
                        latest: (thread.id, post.id, post.time),
                    });
                    tally.count += 1;
                    if post.time >= tally.latest.2 {
                        tally.latest = (thread.id, post.id, post.time);
                    }

                    kept_urls.push(url);
                    if !domains.contains(&domain) {
                        domains.push(domain);
                    }
                }

                if !kept_urls.is_empty() {
                    candidates.push((thread.id, post.id, kept_urls, domains, post.body_text().to_string()));
                }
            }
        }

        let mut ranked: Vec<(String, DomainTally)> = tallies.into_iter().collect();
        ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.top_domains);

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.samples);

        let stamp = |meta: ResultMeta| {
            let mut meta = meta
                .with("total_links", total_links)
                .with("excluded_links", excluded_links)
                .with("root_links_ignored", root_links);
            for (category, count) in &categories {
                meta = meta.with(&format!("category_{}", category.as_str()), *count);
            }
            meta
        };

        let mut records = Vec::with_capacity(ranked.len() + candidates.len());
        for (domain, tally) in ranked {
            let (thread_id, post_id, _) = tally.latest;
            records.push(LinkRecord {
                meta: stamp(ResultMeta::new(now, thread_id, post_id)),
                entry: LinkEntry::Domain {
                    category: LinkCategory::of(&domain),
                    domain,
                    count: tally.count,
                },
            });
        }
        for (thread_id, post_id, urls, domains, body) in candidates {
            let category = domains
                .first()
                .map(|d| LinkCategory::of(d))
                .unwrap_or(LinkCategory::Other);
            records.push(LinkRecord {
                meta: stamp(ResultMeta::new(now, thread_id, post_id)),
                entry: LinkEntry::Sample {
                    urls,
                    domains,
                    category,
                    excerpt: excerpt(&body, 280),
                },
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::storage::testing::limits;
    use crate::models::fixtures::{post, thread};

    fn domains(records: &[LinkRecord]) -> Vec<(String, u32)> {
        records
            .iter()
            .filter_map(|r| match &r.entry {
                LinkEntry::Domain { domain, count, .. } => Some((domain.clone(), *count)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_categories() {
        assert_eq!(LinkCategory::of("reuters.com"), LinkCategory::News);
        assert_eq!(LinkCategory::of("i.imgur.com"), LinkCategory::Image);
        assert_eq!(LinkCategory::of("x.com"), LinkCategory::Social);
        assert_eq!(LinkCategory::of("archive.ph"), LinkCategory::Archive);
        assert_eq!(LinkCategory::of("en.wikipedia.org"), LinkCategory::Reference);
        assert_eq!(LinkCategory::of("example.com"), LinkCategory::Other);
    }

    #[test]
    fn test_video_subdomains_are_excluded() {
        assert!(is_excluded("youtube.com"));
        assert!(is_excluded("m.youtube.com"));
        assert!(is_excluded("music.youtube.com"));
        assert!(!is_excluded("notyoutube.com"));
        assert!(!is_excluded("youtube.com.example.org"));
    }

    #[test]
    fn test_tallies_skip_root_and_video_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = LinkAnalyzer::new(dir.path(), limits(1_000_000), 5, 10);
        let threads = vec![thread(
            1,
            "op links https://op-only.com/a",
            vec![
                post(2, "https://www.reuters.com/a and https://reuters.com/b"),
                post(3, "https://m.youtube.com/watch?v=1 https://youtu.be/2"),
                post(4, "see https://i.imgur.com/x.png"),
                post(5, "no links"),
            ],
        )];

        let records = analyzer.analyze(&threads).unwrap();
        assert_eq!(
            domains(&records),
            vec![("reuters.com".to_string(), 2), ("i.imgur.com".to_string(), 1)]
        );

        let samples: Vec<u64> = records
            .iter()
            .filter(|r| matches!(r.entry, LinkEntry::Sample { .. }))
            .map(|r| r.meta.post_id)
            .collect();
        assert_eq!(samples.len(), 2);
        assert!(!samples.contains(&3));

        let meta = &records[0].meta.metadata;
        assert_eq!(meta["total_links"], 5);
        assert_eq!(meta["excluded_links"], 2);
        assert_eq!(meta["root_links_ignored"], 1);
        assert_eq!(meta["category_news"], 2);
    }

    #[test]
    fn test_sample_size_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = LinkAnalyzer::new(dir.path(), limits(1_000_000), 5, 3);
        let posts = (2..20)
            .map(|n| post(n, &format!("https://site{}.com/page", n)))
            .collect();
        let records = analyzer.analyze(&[thread(1, "op", posts)]).unwrap();

        assert_eq!(domains(&records).len(), 5);
        let samples = records
            .iter()
            .filter(|r| matches!(r.entry, LinkEntry::Sample { .. }))
            .count();
        assert_eq!(samples, 3);
    }
}
