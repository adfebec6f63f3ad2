//! Board Watch Library
//!
//! Harvests threads from an imageboard, runs pluggable analyzers over each
//! harvested batch, and produces LLM-written article summaries on a schedule.

pub mod analyzers;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod harvester;
pub mod llm;
pub mod maintenance;
pub mod models;
pub mod posting;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod summarizer;

pub use analyzers::Registry;
pub use client::{BoardClient, HttpBoardClient, ThreadStub};
pub use config::Config;
pub use db::Database;
pub use error::{BoardError, LlmError, PipelineError};
pub use harvester::Harvester;
pub use llm::{LlmClient, OpenAiTransport, RetryingClient};
pub use maintenance::Maintenance;
pub use models::{Post, Thread};
pub use posting::{DryRunPostingClient, Poster, PostingClient};
pub use scheduler::{Job, Scheduler};
pub use selector::ThreadSelector;
pub use store::ThreadStore;
pub use summarizer::{Summarizer, Summary};
