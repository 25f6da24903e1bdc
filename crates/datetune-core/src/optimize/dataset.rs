//! Labeled query datasets
//!
//! A dataset file is a JSON array whose records take one of two shapes:
//!
//! ```json
//! [
//!   { "query": "articles from last week", "actual_date": "2025-06-09" },
//!   { "generated_query": ["news from june", "june headlines"], "date": "2025-06-12" }
//! ]
//! ```
//!
//! The second shape expands to one [`Query`] per string, all sharing its date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A query paired with the date it is known to refer to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub ground_truth_date: NaiveDate,
}

impl Query {
    pub fn new(text: impl Into<String>, ground_truth_date: NaiveDate) -> Self {
        Self {
            text: text.into(),
            ground_truth_date,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset is not a JSON array: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record {index}: {message}")]
    Record { index: usize, message: String },
}

#[derive(Clone, Debug, Deserialize)]
pub struct SingleRecord {
    pub query: String,
    pub actual_date: NaiveDate,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GeneratedRecord {
    pub generated_query: Vec<String>,
    pub date: NaiveDate,
}

/// One dataset entry
#[derive(Clone, Debug)]
pub enum DatasetRecord {
    Single(SingleRecord),
    Generated(GeneratedRecord),
}

impl DatasetRecord {
    fn from_value(index: usize, value: serde_json::Value) -> Result<Self, DatasetError> {
        let record_err = |message: String| DatasetError::Record { index, message };

        let obj = value
            .as_object()
            .ok_or_else(|| record_err("expected a JSON object".to_string()))?;

        if obj.contains_key("generated_query") {
            serde_json::from_value(value)
                .map(DatasetRecord::Generated)
                .map_err(|e| record_err(e.to_string()))
        } else if obj.contains_key("query") {
            serde_json::from_value(value)
                .map(DatasetRecord::Single)
                .map_err(|e| record_err(e.to_string()))
        } else {
            Err(record_err(
                "expected `query`/`actual_date` or `generated_query`/`date`".to_string(),
            ))
        }
    }

    /// Expand into the queries this record contributes
    pub fn queries(&self) -> Vec<Query> {
        match self {
            DatasetRecord::Single(r) => vec![Query::new(r.query.clone(), r.actual_date)],
            DatasetRecord::Generated(r) => r
                .generated_query
                .iter()
                .map(|q| Query::new(q.clone(), r.date))
                .collect(),
        }
    }
}

/// A parsed dataset file
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub records: Vec<DatasetRecord>,
}

impl Dataset {
    /// Load dataset from a JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, DatasetError> {
        let values: Vec<serde_json::Value> = serde_json::from_str(content)?;
        let records = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| DatasetRecord::from_value(index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    /// All queries, in file order, with generated records expanded
    pub fn queries(&self) -> Vec<Query> {
        self.records.iter().flat_map(|r| r.queries()).collect()
    }
}
