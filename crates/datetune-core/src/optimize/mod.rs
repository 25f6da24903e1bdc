//! Closed-loop optimization of the date extraction prompt
//!
//! ## Overview
//!
//! Each iteration:
//! 1. Runs every labeled query through the extractor under the current prompt
//! 2. Scores each extraction against its ground-truth date
//! 3. Persists the iteration report
//! 4. Stops if nothing failed, otherwise asks the model to extend the prompt
//!    using a sample of the failures, and continues with the extended prompt
//!
//! The loop is bounded by `max_iterations`; the full prompt lineage is written
//! out when it ends.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datetune_core::optimize::{Dataset, Evaluator, OptimizeConfig, Optimizer, PromptRefiner};
//!
//! let config = OptimizeConfig::default();
//! let queries = Dataset::load_from_file("dataset.json")?.queries();
//! let optimizer = Optimizer::new(evaluator, refiner, store, config);
//! let outcome = optimizer.run(&queries, &seed).await?;
//!
//! println!("Final prompt:\n{}", outcome.final_prompt());
//! ```

pub mod controller;
pub mod dataset;
pub mod evaluator;
pub mod refiner;
pub mod scorer;

pub use controller::*;
pub use dataset::*;
pub use evaluator::*;
pub use refiner::*;
pub use scorer::*;

use crate::extraction::RetryPolicy;
use std::time::Duration;

/// Configuration for the optimization loop
#[derive(Clone, Debug)]
pub struct OptimizeConfig {
    /// Upper bound on evaluate/refine rounds
    pub max_iterations: usize,
    /// Extraction calls in flight at once
    pub concurrency: usize,
    /// Pause after each collected result, to stay under provider rate limits
    pub pace: Duration,
    /// Failing cases shown to the model per refinement
    pub max_examples: usize,
    /// Retry budget for each extraction call
    pub retry: RetryPolicy,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            concurrency: 5,
            pace: Duration::from_millis(500),
            max_examples: 15,
            retry: RetryPolicy::default(),
        }
    }
}

impl OptimizeConfig {
    /// Set the iteration budget
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the worker pool width
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-result pacing delay
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OptimizeConfig::default();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_examples, 15);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_builders() {
        let config = OptimizeConfig::default()
            .with_max_iterations(7)
            .with_concurrency(2)
            .with_pace(Duration::ZERO);
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.concurrency, 2);
        assert!(config.pace.is_zero());
    }
}
