//! Pass/fail scoring of an extraction against ground truth

use chrono::NaiveDate;

use crate::extraction::ExtractionResult;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Accurate iff the result carries no error, both bounds parse as calendar
/// dates, and the ground truth falls inside `[start, end]` (inclusive).
/// Anything else is a failure.
pub fn score(result: &ExtractionResult, ground_truth: NaiveDate) -> bool {
    if result.is_error() {
        return false;
    }

    let (Some(start), Some(end)) = (result.start_date.as_deref(), result.end_date.as_deref())
    else {
        return false;
    };

    match (parse_date(start), parse_date(end)) {
        (Some(start), Some(end)) => start <= ground_truth && ground_truth <= end,
        _ => false,
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}
