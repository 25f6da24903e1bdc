//! Runs the extractor over a whole query set and scores the results

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{score, Query};
use crate::extraction::{DateExtractor, ExtractionResult};

/// One query's extraction and whether it hit the ground truth
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub query: Query,
    pub result: ExtractionResult,
    pub is_accurate: bool,
}

impl Verdict {
    /// Score `result` against the query's ground truth
    pub fn judge(query: Query, result: ExtractionResult) -> Self {
        let is_accurate = score(&result, query.ground_truth_date);
        Self {
            query,
            result,
            is_accurate,
        }
    }
}

/// Everything measured in one pass over the query set
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationReport {
    /// 0-based iteration index
    pub iteration: usize,
    pub accuracy: f64,
    /// In completion order, not input order
    pub verdicts: Vec<Verdict>,
}

impl IterationReport {
    pub fn new(iteration: usize, verdicts: Vec<Verdict>) -> Self {
        Self {
            iteration,
            accuracy: accuracy(&verdicts),
            verdicts,
        }
    }

    pub fn failures(&self) -> Vec<&Verdict> {
        self.verdicts.iter().filter(|v| !v.is_accurate).collect()
    }

    pub fn accurate_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.is_accurate).count()
    }
}

/// Fraction of accurate verdicts; 0 for an empty set
pub fn accuracy(verdicts: &[Verdict]) -> f64 {
    if verdicts.is_empty() {
        return 0.0;
    }
    let accurate = verdicts.iter().filter(|v| v.is_accurate).count();
    accurate as f64 / verdicts.len() as f64
}

pub struct Evaluator {
    extractor: Arc<dyn DateExtractor>,
    concurrency: usize,
    pace: Duration,
}

impl Evaluator {
    pub fn new(extractor: Arc<dyn DateExtractor>, concurrency: usize, pace: Duration) -> Self {
        Self {
            extractor,
            concurrency: concurrency.max(1),
            pace,
        }
    }

    /// Extract and score every query under `system_prompt`.
    ///
    /// At most `concurrency` extractions are in flight. Each runs in its own
    /// task, so a panic inside one extraction only costs that query (it is
    /// recorded as a transient failure). Returns once every query has a
    /// verdict.
    pub async fn evaluate(
        &self,
        iteration: usize,
        queries: &[Query],
        system_prompt: &str,
    ) -> IterationReport {
        let prompt: Arc<str> = Arc::from(system_prompt);

        let mut pending = stream::iter(queries.iter().cloned())
            .map(|query| {
                let extractor = Arc::clone(&self.extractor);
                let prompt = Arc::clone(&prompt);
                async move {
                    let text = query.text.clone();
                    let task =
                        tokio::spawn(async move { extractor.extract(&text, &prompt).await });
                    let result = match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!("Extraction task for '{}' failed: {}", query.text, e);
                            ExtractionResult::transient(format!("extraction task failed: {}", e))
                        }
                    };
                    Verdict::judge(query, result)
                }
            })
            .buffer_unordered(self.concurrency);

        let mut verdicts = Vec::with_capacity(queries.len());
        while let Some(verdict) = pending.next().await {
            debug!(
                "[{}/{}] {} '{}'",
                verdicts.len() + 1,
                queries.len(),
                if verdict.is_accurate { "✓" } else { "✗" },
                verdict.query.text
            );
            verdicts.push(verdict);
            if !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
        }

        IterationReport::new(iteration, verdicts)
    }
}
