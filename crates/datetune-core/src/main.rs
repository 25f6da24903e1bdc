//! One-shot date range extraction
//!
//! Usage:
//!   datetune "articles about the election from last week"
//!   datetune --prompt-file prompts/latest.txt "news from this spring"

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use datetune_core::{seed_prompt, Config, DateExtractor, LlmExtractor, RetryPolicy};
use datetune_llm::{ChatClient, LanguageModel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "datetune", version, about = "Extract a date range from a free-text query")]
struct Args {
    /// The query to extract a date range from
    #[arg(required = true)]
    query: Vec<String>,

    /// Instruction prompt to use instead of the built-in seed prompt
    #[arg(long, env = "DATETUNE_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,

    /// Reference date for relative expressions (defaults to today)
    #[arg(long)]
    today: Option<NaiveDate>,

    /// Attempts per extraction before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "datetune_core=info,warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    let system_prompt = match &args.prompt_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?,
        None => seed_prompt(args.today.unwrap_or_else(|| chrono::Local::now().date_naive())),
    };

    info!("Model: {} @ {}", config.llm_model, config.llm_api_url);

    let llm: Arc<dyn LanguageModel> = Arc::new(ChatClient::new(config.chat_settings())?);
    let extractor = LlmExtractor::new(
        llm,
        RetryPolicy {
            max_attempts: args.max_attempts,
            ..RetryPolicy::default()
        },
    );

    let query = args.query.join(" ");
    let result = extractor.extract(&query, &system_prompt).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
