//! Error kinds that callers branch on
//!
//! Everything else travels as `anyhow::Error`.

use thiserror::Error;

/// Failures reported by the board API client
#[derive(Error, Debug)]
pub enum BoardError {
    /// HTTP 429: back off and retry the same request
    #[error("Board rate limited the request")]
    RateLimited,

    /// Thread was pruned or archived
    #[error("Thread {0} not found")]
    NotFound(u64),

    #[error("Board request failed with status {0}")]
    Http(u16),

    #[error("Board transport error: {0}")]
    Transport(String),

    #[error("Failed to decode board response: {0}")]
    Decode(String),
}

/// Pipeline-level failures that propagate to the scheduler
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Insufficient disk space at {path}: {available} bytes available, {required} required")]
    InsufficientDiskSpace {
        path: String,
        available: u64,
        required: u64,
    },

    #[error("Analyzer '{0}' is already registered")]
    DuplicateAnalyzer(String),

    #[error("All {0} analyzers failed")]
    AllAnalyzersFailed(usize),

    #[error("Selected {found} threads, {required} required")]
    SelectionShortfall { found: usize, required: usize },

    #[error("No articles were generated for the batch")]
    EmptyBatch,
}

/// Failures from one call to the completion service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Completion service returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Completion transport error: {0}")]
    Transport(String),

    #[error("Malformed completion response: {0}")]
    Malformed(String),

    #[error("Completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<LlmError> },
}
