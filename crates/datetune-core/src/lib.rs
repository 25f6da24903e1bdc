//! Datetune Core Library
//!
//! Date range extraction from free-text queries, and the feedback loop that
//! tunes the extraction prompt against a labeled dataset.

pub mod config;
pub mod extraction;
pub mod optimize;
pub mod storage;

// Re-export key types for convenience
pub use config::Config;
pub use extraction::{
    seed_prompt, DateExtractor, ErrorKind, ExtractionResult, LlmExtractor, RetryPolicy,
};
pub use optimize::{LoopState, OptimizeConfig, Optimizer};
pub use storage::{JsonFileStore, RunStore};
