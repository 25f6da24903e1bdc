//! Durable output of an optimization run
//!
//! Reports are written as each iteration finishes; the prompt history and
//! run summary are written once the loop stops. The JSON file layout is:
//!
//! ```text
//! <dir>/<prefix>_iter1.json     # first iteration's report
//! <dir>/<prefix>_iter2.json
//! <dir>/<prefix>_prompts.json   # every prompt, seed first
//! <dir>/<prefix>_summary.json
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::optimize::{IterationReport, PromptHistory, RunSummary};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the optimization loop persists its results
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_report(&self, report: &IterationReport) -> Result<(), StorageError>;
    async fn save_history(&self, history: &PromptHistory) -> Result<(), StorageError>;
    async fn save_summary(&self, summary: &RunSummary) -> Result<(), StorageError>;
}

/// Pretty-printed JSON files in one directory, named by a common prefix
pub struct JsonFileStore {
    dir: PathBuf,
    prefix: String,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Path of the report for a 0-based iteration index (files are numbered from 1)
    pub fn report_path(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("{}_iter{}.json", self.prefix, iteration + 1))
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(format!("{}_prompts.json", self.prefix))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("{}_summary.json", self.prefix))
    }

    async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        what: &'static str,
        value: &T,
    ) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|source| StorageError::Serialize { what, source })?;

        let io_err = |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        tokio::fs::write(path, content).await.map_err(io_err)?;

        debug!("Wrote {} to {}", what, path.display());
        Ok(())
    }
}

#[async_trait]
impl RunStore for JsonFileStore {
    async fn save_report(&self, report: &IterationReport) -> Result<(), StorageError> {
        self.write_json(&self.report_path(report.iteration), "iteration report", report)
            .await
    }

    async fn save_history(&self, history: &PromptHistory) -> Result<(), StorageError> {
        self.write_json(&self.history_path(), "prompt history", history)
            .await
    }

    async fn save_summary(&self, summary: &RunSummary) -> Result<(), StorageError> {
        self.write_json(&self.summary_path(), "run summary", summary)
            .await
    }
}
