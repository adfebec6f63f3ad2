//! Stratified thread selection for LLM analysis
//!
//! Picks, in order: the three busiest threads, up to three from each of the
//! `[200, 300)` and `[100, 200)` post-count bands, up to three more from
//! anything with at least 50 posts, then backfills from the same pool until
//! the required size is reached.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::Thread;

/// Post-count floor for the busy stratum and the random backfill
pub const MIN_POSTS: usize = 50;

const PER_STRATUM: usize = 3;

/// Outcome of one selection pass
#[derive(Debug)]
pub struct Selection<'a> {
    pub threads: Vec<&'a Thread>,
    pub required: usize,
}

impl<'a> Selection<'a> {
    pub fn is_complete(&self) -> bool {
        self.threads.len() >= self.required
    }

    pub fn ids(&self) -> Vec<u64> {
        self.threads.iter().map(|t| t.id).collect()
    }

    /// Fail loudly when fewer than the required threads were found
    pub fn require(self) -> Result<Vec<&'a Thread>, PipelineError> {
        if !self.is_complete() {
            return Err(PipelineError::SelectionShortfall {
                found: self.threads.len(),
                required: self.required,
            });
        }
        Ok(self.threads)
    }
}

pub struct ThreadSelector {
    required: usize,
}

impl ThreadSelector {
    pub fn new(required: usize) -> Self {
        Self { required }
    }

    pub fn select<'a, R: Rng + ?Sized>(&self, pool: &'a [Thread], rng: &mut R) -> Selection<'a> {
        let mut ranked: Vec<&Thread> = pool.iter().collect();
        ranked.sort_by(|a, b| b.post_count().cmp(&a.post_count()).then_with(|| b.id.cmp(&a.id)));

        let mut chosen: Vec<&Thread> = Vec::with_capacity(self.required);
        let mut seen: HashSet<u64> = HashSet::new();

        let mut take = |candidates: Vec<&'a Thread>, limit: usize, chosen: &mut Vec<&'a Thread>| {
            for thread in candidates.into_iter().take(limit) {
                if chosen.len() >= self.required {
                    break;
                }
                if seen.insert(thread.id) {
                    chosen.push(thread);
                }
            }
        };

        // Busiest overall
        take(ranked.iter().take(PER_STRATUM).copied().collect(), PER_STRATUM, &mut chosen);

        let bands: [(usize, Option<usize>); 3] =
            [(200, Some(300)), (100, Some(200)), (MIN_POSTS, None)];
        for (low, high) in bands {
            let mut band: Vec<&Thread> = ranked
                .iter()
                .copied()
                .filter(|t| {
                    let n = t.post_count();
                    n >= low && high.map_or(true, |h| n < h) && !chosen.iter().any(|c| c.id == t.id)
                })
                .collect();
            band.shuffle(rng);
            take(band, PER_STRATUM, &mut chosen);
        }

        if chosen.len() < self.required {
            let mut rest: Vec<&Thread> = ranked
                .iter()
                .copied()
                .filter(|t| t.post_count() >= MIN_POSTS && !chosen.iter().any(|c| c.id == t.id))
                .collect();
            rest.shuffle(rng);
            let missing = self.required - chosen.len();
            take(rest, missing, &mut chosen);
        }

        if chosen.len() < self.required {
            warn!(
                "Selected only {} of {} required threads from a pool of {}",
                chosen.len(),
                self.required,
                pool.len()
            );
        } else {
            info!("Selected {} threads from a pool of {}", chosen.len(), pool.len());
        }

        Selection {
            threads: chosen,
            required: self.required,
        }
    }
}
