//! Date range extraction
//!
//! Sends a query to the language model under a given instruction prompt and
//! turns whatever comes back into an [`ExtractionResult`]. Failures never
//! escape as errors: they are folded into the result's [`ErrorKind`] so a
//! batch of extractions can always be scored.

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use datetune_llm::{LanguageModel, ResponseFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder returned for policy-refused queries. It lies far before any
/// ground truth in the datasets, so scoring fails closed.
pub const SENTINEL_DATE: &str = "1900-01-01";

/// Why an extraction did not produce a usable answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Response was never valid JSON within the retry budget
    ParseError,
    /// Provider refused the query; not retried
    ContentFiltered,
    /// Network, rate limit, timeout or any other call failure, after retries
    TransientError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::ContentFiltered => "content_filtered",
            ErrorKind::TransientError => "transient_error",
        };
        f.write_str(label)
    }
}

/// Outcome of one extraction call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Raw model output, kept when it could not be parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExtractionResult {
    /// A successful parse. Both bounds `None` means no date reference was found.
    pub fn dates(start_date: Option<String>, end_date: Option<String>) -> Self {
        Self {
            start_date,
            end_date,
            error: None,
            raw: None,
            detail: None,
        }
    }

    pub fn parse_error(raw: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            start_date: None,
            end_date: None,
            error: Some(ErrorKind::ParseError),
            raw: Some(raw.into()),
            detail: Some(detail.into()),
        }
    }

    pub fn content_filtered(detail: impl Into<String>) -> Self {
        Self {
            start_date: Some(SENTINEL_DATE.to_string()),
            end_date: Some(SENTINEL_DATE.to_string()),
            error: Some(ErrorKind::ContentFiltered),
            raw: None,
            detail: Some(detail.into()),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            start_date: None,
            end_date: None,
            error: Some(ErrorKind::TransientError),
            raw: None,
            detail: Some(detail.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True for a clean parse that found no date reference
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.start_date.is_none() && self.end_date.is_none()
    }
}

/// Bounded retry with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given (0-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Anything that can turn a query into a date range under an instruction prompt
#[async_trait]
pub trait DateExtractor: Send + Sync {
    async fn extract(&self, query_text: &str, system_prompt: &str) -> ExtractionResult;
}

/// Extractor backed by a language model call
pub struct LlmExtractor {
    llm: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }
}

#[async_trait]
impl DateExtractor for LlmExtractor {
    async fn extract(&self, query_text: &str, system_prompt: &str) -> ExtractionResult {
        let attempts = self.retry.max_attempts.max(1);
        let query_short = &query_text[..floor_char_boundary(query_text, 60)];
        let mut outcome = ExtractionResult::transient("no attempt made");

        for attempt in 0..attempts {
            match self
                .llm
                .complete(system_prompt, query_text, ResponseFormat::JsonObject)
                .await
            {
                Ok(text) => match parse_date_range(&text) {
                    Ok(range) => {
                        debug!(
                            "Extracted {:?}..{:?} for '{}'",
                            range.start_date, range.end_date, query_short
                        );
                        return ExtractionResult::dates(range.start_date, range.end_date);
                    }
                    Err(e) => {
                        warn!(
                            "JSON parsing error (attempt {}/{}) for '{}': {}",
                            attempt + 1,
                            attempts,
                            query_short,
                            e
                        );
                        outcome = ExtractionResult::parse_error(text, e.to_string());
                    }
                },
                Err(e) if e.is_content_policy() => {
                    warn!("Content filter triggered for query: '{}'", query_short);
                    return ExtractionResult::content_filtered(e.to_string());
                }
                Err(e) => {
                    warn!(
                        "Extraction call failed (attempt {}/{}) for '{}': {}",
                        attempt + 1,
                        attempts,
                        query_short,
                        e
                    );
                    outcome = ExtractionResult::transient(e.to_string());
                }
            }

            if attempt + 1 < attempts {
                let delay = self.retry.backoff(attempt);
                debug!("Backing off for {:?} before retry", delay);
                tokio::time::sleep(delay).await;
            }
        }

        outcome
    }
}

/// Fields the model is asked to return
#[derive(Debug, Default, Deserialize)]
struct DateRangeResponse {
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

/// Parse the model's JSON answer, which must be an object. Tolerates
/// surrounding prose or code fences by reading from the first `{` to the
/// last `}` when the whole reply is not valid JSON.
fn parse_date_range(response: &str) -> Result<DateRangeResponse, serde_json::Error> {
    let value: serde_json::Value = match serde_json::from_str(response.trim()) {
        Ok(value) => value,
        Err(e) => match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str(&response[start..=end])?
            }
            _ => return Err(e),
        },
    };

    if !value.is_object() {
        return Err(serde::de::Error::custom(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    serde_json::from_value(value)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Default starting instruction for date extraction, anchored on `today`
pub fn seed_prompt(today: NaiveDate) -> String {
    let last_monday =
        today - ChronoDuration::days(today.weekday().num_days_from_monday() as i64 + 7);
    let today = today.format("%Y-%m-%d");
    let last_monday = last_monday.format("%Y-%m-%d");

    format!(
        r#"You extract time references from search queries and convert them into a date range in YYYY-MM-DD format.

RULES:
- Today's date is {today}. Resolve every relative reference ("3 weeks ago", "last month") against it.
- Vague references such as "recently", "lately" or "these days" mean the past week or past month, depending on context.
- Phrases like "over the past few weeks" call for a range, not a single day.
- If a publication date is given and differs from other dates in the text, use the publication date only.
- "last week" runs from the Monday of the previous week through its Sunday. With today at {today}, last week starts on {last_monday}.
- "N weeks ago" is the Monday-to-Sunday week N weeks back.
- "last month" starts on the first day of the previous month; "N months ago" starts on the first day of that month.
- "this year" runs from January 1st of the current year through today.
- Never return dates in the future. A month later than the current one refers to the previous year.
- Seasons may overlap: winter is December to March, spring March to June, summer June to September, fall September to December.
- If the query has no time reference, return null for both fields.

OUTPUT FORMAT:
Respond with a single JSON object and nothing else:
{{"start_date": "YYYY-MM-DD" or null, "end_date": "YYYY-MM-DD" or null}}"#
    )
}
