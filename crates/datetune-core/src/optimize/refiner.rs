//! Prompt refinement from failed extractions
//!
//! Shows the model a capped sample of failures alongside the current prompt
//! and asks for an extended prompt. Refinement is best-effort: if the call
//! fails, the previous prompt comes back unchanged.

use datetune_llm::{LanguageModel, ResponseFormat};
use std::sync::Arc;
use tracing::{info, warn};

use super::Verdict;

pub const REFINER_INSTRUCTION: &str =
    "You are an expert prompt engineer specializing in date extraction tasks.";

pub struct PromptRefiner {
    llm: Arc<dyn LanguageModel>,
}

impl PromptRefiner {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Ask the model for an extended version of `previous_prompt` that covers
    /// the first `max_examples` of `failing_cases`.
    ///
    /// Never fails: any capability error, or an empty answer, yields
    /// `previous_prompt` unchanged.
    pub async fn refine(
        &self,
        previous_prompt: &str,
        failing_cases: &[&Verdict],
        max_examples: usize,
    ) -> String {
        let request = build_refinement_request(previous_prompt, failing_cases, max_examples);
        info!(
            "Refining prompt from {} of {} failing cases",
            failing_cases.len().min(max_examples),
            failing_cases.len()
        );

        match self
            .llm
            .complete(REFINER_INSTRUCTION, &request, ResponseFormat::Text)
            .await
        {
            Ok(response) => {
                let improved = response.trim();
                if improved.is_empty() {
                    warn!("Refinement returned an empty prompt, keeping the previous one");
                    return previous_prompt.to_string();
                }
                info!(
                    "Refined prompt: {} -> {} chars",
                    previous_prompt.len(),
                    improved.len()
                );
                improved.to_string()
            }
            Err(e) => {
                warn!("Error improving prompt, keeping the previous one: {}", e);
                previous_prompt.to_string()
            }
        }
    }
}

/// Format one failure for the meta-prompt
fn describe_failure(verdict: &Verdict) -> String {
    let result = &verdict.result;
    let mut line = format!(
        "Query: '{}'\nExpected: {}\nGot: {} to {}",
        verdict.query.text,
        verdict.query.ground_truth_date.format("%Y-%m-%d"),
        result.start_date.as_deref().unwrap_or("None"),
        result.end_date.as_deref().unwrap_or("None"),
    );
    if let Some(kind) = result.error {
        line.push_str(&format!(" (error: {})", kind));
    }
    line
}

/// Build the user message sent to the model for one refinement round
pub fn build_refinement_request(
    previous_prompt: &str,
    failing_cases: &[&Verdict],
    max_examples: usize,
) -> String {
    let examples: Vec<String> = failing_cases
        .iter()
        .take(max_examples)
        .map(|v| describe_failure(v))
        .collect();

    format!(
        "Analyze these {count} failed date extraction cases:\n\n\
         {examples}\n\n\
         Current prompt:\n\
         {previous_prompt}\n\n\
         Improve the prompt by adding instructions and information to it. \
         Do not remove anything already in the prompt.\n\
         Your additions should cover:\n\
         1. Common error patterns you observe\n\
         2. Specific improvements to handle these cases\n\
         3. Clearer instructions for edge cases\n\
         The improved prompt must contain everything from the current prompt plus your additions.\n\
         Return only the improved prompt.",
        count = examples.len(),
        examples = examples.join("\n\n"),
    )
}
