//! Prompt optimization CLI for datetune
//!
//! Evaluates the extraction prompt against a labeled dataset and lets the
//! model extend it from the failures, for a bounded number of iterations.
//!
//! Usage:
//!   cargo run --bin prompt-optimize -- --dataset data/queries.json
//!   cargo run --bin prompt-optimize -- --dataset data/queries.json --seed-prompt prompts/v3.txt --max-iterations 5

use anyhow::{Context, Result};
use clap::Parser;
use datetune_core::optimize::{Dataset, Evaluator, OptimizeConfig, Optimizer, PromptRefiner};
use datetune_core::{seed_prompt, Config, JsonFileStore, LlmExtractor, RetryPolicy, RunStore};
use datetune_llm::{ChatClient, LanguageModel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "prompt-optimize",
    version,
    about = "Tune the date extraction prompt against a labeled dataset"
)]
struct Args {
    /// JSON dataset of {query, actual_date} / {generated_query, date} records
    #[arg(long, env = "DATETUNE_DATASET")]
    dataset: PathBuf,

    /// Starting prompt (defaults to the built-in seed prompt for today)
    #[arg(long, env = "DATETUNE_SEED_PROMPT")]
    seed_prompt: Option<PathBuf>,

    #[arg(long, env = "DATETUNE_MAX_ITERATIONS", default_value_t = 3)]
    max_iterations: usize,

    /// Extraction calls in flight at once
    #[arg(long, env = "DATETUNE_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Pause after each collected result, in milliseconds
    #[arg(long, env = "DATETUNE_DELAY_MS", default_value_t = 500)]
    delay_ms: u64,

    /// Failing cases shown to the model per refinement
    #[arg(long, env = "DATETUNE_MAX_EXAMPLES", default_value_t = 15)]
    max_examples: usize,

    /// Attempts per extraction before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Delay before the first retry, in milliseconds (doubles per retry)
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,

    #[arg(long, env = "DATETUNE_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, env = "DATETUNE_OUTPUT_PREFIX", default_value = "prompt_loop")]
    output_prefix: String,
}

impl Args {
    fn optimize_config(&self) -> OptimizeConfig {
        OptimizeConfig {
            max_iterations: self.max_iterations,
            concurrency: self.workers,
            pace: Duration::from_millis(self.delay_ms),
            max_examples: self.max_examples,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "datetune_core=debug,datetune_llm=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;
    let optimize_config = args.optimize_config();

    println!("=== Prompt Optimization ===\n");
    println!("Model: {} @ {}", config.llm_model, config.llm_api_url);

    let dataset = Dataset::load_from_file(&args.dataset)
        .with_context(|| format!("Failed to load dataset {}", args.dataset.display()))?;
    let queries = dataset.queries();
    println!("Queries: {}", queries.len());

    let seed = match &args.seed_prompt {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed prompt: {}", path.display()))?,
        None => seed_prompt(chrono::Local::now().date_naive()),
    };
    println!("Seed prompt length: {} chars\n", seed.len());

    // One client for the whole run, shared by extraction and refinement
    let llm: Arc<dyn LanguageModel> = Arc::new(ChatClient::new(config.chat_settings())?);

    let extractor = Arc::new(LlmExtractor::new(llm.clone(), optimize_config.retry.clone()));
    let evaluator = Evaluator::new(extractor, optimize_config.concurrency, optimize_config.pace);
    let store = Arc::new(JsonFileStore::new(&args.output_dir, &args.output_prefix));
    let history_path = store.history_path();
    let summary_path = store.summary_path();
    let store: Arc<dyn RunStore> = store;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to listen for Ctrl-C");
            return;
        }
        warn!(
            "Ctrl-C received, finishing the current iteration before stopping \
             (press Ctrl-C again to abort)"
        );
        let _ = shutdown_tx.send(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second Ctrl-C received, aborting without saving the prompt history");
            std::process::exit(130);
        }
    });

    let optimizer = Optimizer::new(evaluator, PromptRefiner::new(llm), store, optimize_config)
        .with_shutdown(shutdown_rx);

    let outcome = optimizer.run(&queries, &seed).await?;

    println!("\n============================================================");
    println!("OPTIMIZATION COMPLETE ({:?})", outcome.state);
    println!("============================================================");

    println!("\nAccuracy by iteration:");
    for report in &outcome.reports {
        println!(
            "  Iteration {}: {:.2}% ({}/{})",
            report.iteration + 1,
            report.accuracy * 100.0,
            report.accurate_count(),
            report.verdicts.len()
        );
    }

    println!("\nPrompt history: {}", history_path.display());
    println!("Run summary: {}", summary_path.display());
    info!("Run {} complete", outcome.run_id);

    Ok(())
}
