//! The evaluate → refine loop
//!
//! ```text
//! Running(0) ──evaluate──▶ no failures ──────────────▶ Converged
//!     │                        │
//!     │                   failures: refine, push prompt
//!     │                        │
//!     │            i + 1 == max_iterations ───────────▶ Exhausted
//!     │                        │
//!     ◀──────────── Running(i + 1)
//!
//! stop requested before an iteration starts ─────────▶ Interrupted
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use super::{Evaluator, IterationReport, OptimizeConfig, PromptRefiner, Query};
use crate::storage::RunStore;

/// Every prompt that has driven extraction, seed first. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptHistory(Vec<String>);

impl PromptHistory {
    pub fn new(seed: impl Into<String>) -> Self {
        Self(vec![seed.into()])
    }

    pub fn seed(&self) -> &str {
        &self.0[0]
    }

    /// The prompt the next iteration will run with
    pub fn current(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn push(&mut self, prompt: impl Into<String>) {
        self.0.push(prompt.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn prompts(&self) -> &[String] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// About to run the iteration with this 0-based index
    Running(usize),
    /// An iteration finished with no failing verdicts
    Converged,
    /// Iteration budget used up
    Exhausted,
    /// Stop was requested between iterations
    Interrupted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub accuracy: f64,
    pub failures: usize,
}

/// Run-level record written when the loop stops
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: LoopState,
    pub query_count: usize,
    pub iterations: Vec<IterationSummary>,
    pub seed_prompt: String,
    pub final_prompt: String,
}

/// What a finished run produced
#[derive(Clone, Debug)]
pub struct OptimizationOutcome {
    pub run_id: Uuid,
    pub state: LoopState,
    pub history: PromptHistory,
    pub reports: Vec<IterationReport>,
}

impl OptimizationOutcome {
    pub fn final_prompt(&self) -> &str {
        self.history.current()
    }

    pub fn iterations_run(&self) -> usize {
        self.reports.len()
    }

    pub fn final_accuracy(&self) -> Option<f64> {
        self.reports.last().map(|r| r.accuracy)
    }
}

pub struct Optimizer {
    evaluator: Evaluator,
    refiner: PromptRefiner,
    store: Arc<dyn RunStore>,
    config: OptimizeConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Optimizer {
    pub fn new(
        evaluator: Evaluator,
        refiner: PromptRefiner,
        store: Arc<dyn RunStore>,
        config: OptimizeConfig,
    ) -> Self {
        Self {
            evaluator,
            refiner,
            store,
            config,
            shutdown: None,
        }
    }

    /// Stop before the next iteration once this flag turns true.
    /// In-flight extractions are never aborted.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run the loop from `seed_prompt` until it converges, exhausts its
    /// iteration budget or is asked to stop.
    ///
    /// Per-query failures never end the run; only failing to persist results does.
    pub async fn run(&self, queries: &[Query], seed_prompt: &str) -> Result<OptimizationOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        info!("Starting prompt optimization (run {})", run_id);
        info!("  Queries: {}", queries.len());
        info!("  Max iterations: {}", self.config.max_iterations);
        info!("  Workers: {}", self.config.concurrency);

        let mut history = PromptHistory::new(seed_prompt);
        let mut reports: Vec<IterationReport> = Vec::new();
        let mut state = if self.config.max_iterations == 0 {
            LoopState::Exhausted
        } else {
            LoopState::Running(0)
        };

        while let LoopState::Running(iteration) = state {
            if self.stop_requested() {
                info!("Stop requested, not starting iteration {}", iteration + 1);
                state = LoopState::Interrupted;
                break;
            }

            info!("--- Iteration {} ---", iteration + 1);
            let report = self
                .evaluator
                .evaluate(iteration, queries, history.current())
                .await;
            self.store
                .save_report(&report)
                .await
                .with_context(|| format!("Failed to save report for iteration {}", iteration + 1))?;

            info!(
                "Accuracy after iteration {}: {:.2}% ({}/{})",
                iteration + 1,
                report.accuracy * 100.0,
                report.accurate_count(),
                report.verdicts.len()
            );

            let failures = report.failures();
            let next = if failures.is_empty() {
                info!("No inaccurate queries left. Stopping early.");
                LoopState::Converged
            } else {
                let improved = self
                    .refiner
                    .refine(history.current(), &failures, self.config.max_examples)
                    .await;
                history.push(improved);

                if iteration + 1 >= self.config.max_iterations {
                    LoopState::Exhausted
                } else {
                    LoopState::Running(iteration + 1)
                }
            };

            reports.push(report);
            state = next;
        }

        self.store
            .save_history(&history)
            .await
            .context("Failed to save prompt history")?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state,
            query_count: queries.len(),
            iterations: reports
                .iter()
                .map(|r| IterationSummary {
                    iteration: r.iteration,
                    accuracy: r.accuracy,
                    failures: r.verdicts.len() - r.accurate_count(),
                })
                .collect(),
            seed_prompt: history.seed().to_string(),
            final_prompt: history.current().to_string(),
        };
        self.store
            .save_summary(&summary)
            .await
            .context("Failed to save run summary")?;

        info!(
            "Optimization finished: {:?} after {} iteration(s), {} prompt(s) in history",
            state,
            reports.len(),
            history.len()
        );

        Ok(OptimizationOutcome {
            run_id,
            state,
            history,
            reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{DateExtractor, ExtractionResult, LlmExtractor, RetryPolicy};
    use crate::optimize::Dataset;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use datetune_llm::{LanguageModel, LlmError, ResponseFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Keeps everything in memory
    #[derive(Default)]
    struct MemoryStore {
        reports: Mutex<Vec<IterationReport>>,
        history: Mutex<Option<PromptHistory>>,
        summary: Mutex<Option<RunSummary>>,
    }

    #[async_trait]
    impl RunStore for MemoryStore {
        async fn save_report(&self, report: &IterationReport) -> Result<(), StorageError> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn save_history(&self, history: &PromptHistory) -> Result<(), StorageError> {
            *self.history.lock().unwrap() = Some(history.clone());
            Ok(())
        }

        async fn save_summary(&self, summary: &RunSummary) -> Result<(), StorageError> {
            *self.summary.lock().unwrap() = Some(summary.clone());
            Ok(())
        }
    }

    /// Accurate only once the prompt has been refined `needed` times.
    /// Records which prompt each extraction saw.
    struct PromptGatedExtractor {
        needed: usize,
        seen_prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DateExtractor for PromptGatedExtractor {
        async fn extract(&self, _query_text: &str, system_prompt: &str) -> ExtractionResult {
            self.seen_prompts
                .lock()
                .unwrap()
                .push(system_prompt.to_string());
            let refinements = system_prompt.matches("+fix").count();
            if refinements >= self.needed {
                ExtractionResult::dates(Some("2025-06-01".into()), Some("2025-06-30".into()))
            } else {
                ExtractionResult::dates(None, None)
            }
        }
    }

    /// Refinement model: appends "+fix" to the prompt it is shown.
    /// Counts calls; can be told to fail.
    struct AppendingModel {
        calls: AtomicUsize,
        fail: bool,
    }

    impl AppendingModel {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl LanguageModel for AppendingModel {
        async fn complete(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            _format: ResponseFormat,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::EmptyResponse);
            }
            let current = user_prompt
                .split("Current prompt:\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\n").next())
                .unwrap_or_default();
            Ok(format!("{} +fix", current))
        }
    }

    fn queries() -> Vec<Query> {
        vec![
            Query::new("early june", date(2025, 6, 3)),
            Query::new("mid june", date(2025, 6, 15)),
        ]
    }

    fn optimizer(
        extractor: Arc<dyn DateExtractor>,
        model: Arc<AppendingModel>,
        store: Arc<MemoryStore>,
        max_iterations: usize,
    ) -> Optimizer {
        let config = OptimizeConfig::default()
            .with_max_iterations(max_iterations)
            .with_pace(Duration::ZERO);
        Optimizer::new(
            Evaluator::new(extractor, config.concurrency, config.pace),
            PromptRefiner::new(model),
            store,
            config,
        )
    }

    fn gated(needed: usize) -> Arc<PromptGatedExtractor> {
        Arc::new(PromptGatedExtractor {
            needed,
            seen_prompts: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_converges_on_first_iteration() {
        let model = AppendingModel::new(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(0), model.clone(), store.clone(), 3);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Converged);
        assert_eq!(outcome.iterations_run(), 1);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.final_prompt(), "seed");
        assert_eq!(outcome.final_accuracy(), Some(1.0));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        assert_eq!(store.reports.lock().unwrap().len(), 1);
        assert_eq!(
            store.history.lock().unwrap().as_ref().unwrap().prompts(),
            &["seed".to_string()]
        );
        let summary = store.summary.lock().unwrap().clone().unwrap();
        assert_eq!(summary.state, LoopState::Converged);
        assert_eq!(summary.run_id, outcome.run_id);
        assert_eq!(summary.seed_prompt, "seed");
        assert_eq!(summary.final_prompt, "seed");
    }

    #[tokio::test]
    async fn test_exhausts_budget_without_convergence() {
        let model = AppendingModel::new(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(usize::MAX), model.clone(), store.clone(), 3);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Exhausted);
        assert_eq!(outcome.history.len(), 4);
        assert_eq!(
            outcome.history.prompts(),
            &["seed", "seed +fix", "seed +fix +fix", "seed +fix +fix +fix"]
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);

        let reports = store.reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        let indices: Vec<usize> = reports.iter().map(|r| r.iteration).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(reports.iter().all(|r| r.accuracy == 0.0));
        assert_eq!(store.history.lock().unwrap().as_ref().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_refined_prompt_drives_next_iteration() {
        let extractor = gated(1);
        let model = AppendingModel::new(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(extractor.clone(), model, store, 3);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Converged);
        assert_eq!(outcome.iterations_run(), 2);
        assert_eq!(outcome.history.prompts(), &["seed", "seed +fix"]);
        assert_eq!(outcome.reports[0].accuracy, 0.0);
        assert_eq!(outcome.reports[1].accuracy, 1.0);

        let seen = extractor.seen_prompts.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.iter().filter(|p| p.as_str() == "seed").count(), 2);
        assert_eq!(seen.iter().filter(|p| p.as_str() == "seed +fix").count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refinement_keeps_prompt() {
        let model = AppendingModel::new(true);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(usize::MAX), model.clone(), store, 2);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Exhausted);
        assert_eq!(outcome.history.prompts(), &["seed", "seed", "seed"]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_dataset_completes() {
        let model = AppendingModel::new(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(0), model.clone(), store.clone(), 3);

        let outcome = opt.run(&[], "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Converged);
        assert_eq!(outcome.final_accuracy(), Some(0.0));
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(store.history.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_iterations() {
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(0), AppendingModel::new(false), store.clone(), 0);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Exhausted);
        assert_eq!(outcome.iterations_run(), 0);
        assert_eq!(outcome.history.len(), 1);
        assert!(store.reports.lock().unwrap().is_empty());
        assert!(store.history.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_before_first_iteration() {
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(gated(usize::MAX), AppendingModel::new(false), store.clone(), 3)
            .with_shutdown(rx);
        tx.send(true).unwrap();

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Interrupted);
        assert_eq!(outcome.iterations_run(), 0);
        assert_eq!(
            store.summary.lock().unwrap().as_ref().unwrap().state,
            LoopState::Interrupted
        );
    }

    /// Never accurate; requests a stop as soon as it is called
    struct StoppingExtractor {
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl DateExtractor for StoppingExtractor {
        async fn extract(&self, _query_text: &str, _system_prompt: &str) -> ExtractionResult {
            let _ = self.stop.send(true);
            ExtractionResult::dates(None, None)
        }
    }

    #[tokio::test]
    async fn test_stop_during_iteration_finishes_it() {
        let (tx, rx) = watch::channel(false);
        let model = AppendingModel::new(false);
        let store = Arc::new(MemoryStore::default());
        let opt = optimizer(
            Arc::new(StoppingExtractor { stop: tx }),
            model.clone(),
            store.clone(),
            3,
        )
        .with_shutdown(rx);

        let outcome = opt.run(&queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Interrupted);
        assert_eq!(outcome.iterations_run(), 1);
        assert_eq!(outcome.reports[0].verdicts.len(), 2);
        assert_eq!(store.reports.lock().unwrap().len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        let history = store.history.lock().unwrap().clone().unwrap();
        assert_eq!(history.prompts(), &["seed", "seed +fix"]);
        let summary = store.summary.lock().unwrap().clone().unwrap();
        assert_eq!(summary.state, LoopState::Interrupted);
        assert_eq!(summary.iterations.len(), 1);
        assert_eq!(summary.final_prompt, "seed +fix");
    }

    /// Canned model answer for the single dataset query
    struct LastWeekModel;

    #[async_trait]
    impl LanguageModel for LastWeekModel {
        async fn complete(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            format: ResponseFormat,
        ) -> Result<String, LlmError> {
            assert_eq!(format, ResponseFormat::JsonObject, "refiner must not be called");
            assert_eq!(user_prompt, "articles from last week");
            Ok(r#"{"start_date": "2025-06-09", "end_date": "2025-06-15"}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_end_to_end_last_week() {
        let dataset = Dataset::from_json_str(
            r#"[{"query": "articles from last week", "actual_date": "2025-06-09"}]"#,
        )
        .unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(LastWeekModel);
        let config = OptimizeConfig::default().with_pace(Duration::ZERO);
        let extractor = Arc::new(LlmExtractor::new(llm.clone(), RetryPolicy::immediate(3)));
        let store = Arc::new(MemoryStore::default());
        let opt = Optimizer::new(
            Evaluator::new(extractor, config.concurrency, config.pace),
            PromptRefiner::new(llm),
            store.clone(),
            config,
        );

        let outcome = opt.run(&dataset.queries(), "seed").await.unwrap();

        assert_eq!(outcome.state, LoopState::Converged);
        assert_eq!(outcome.final_accuracy(), Some(1.0));
        assert_eq!(outcome.iterations_run(), 1);
        assert_eq!(outcome.history.len(), 1);
    }
}
