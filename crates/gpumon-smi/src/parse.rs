//! Parsing of `--format=csv,noheader` output.

use crate::error::{SmiError, SmiResult};

/// One sampled value for a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    /// Truncating integer mean over every data line.
    pub value: i64,
    /// Unit token as printed by the tool (`"%"`, `"MiB"`, ...). Informational.
    pub raw_unit: String,
}

/// Split tool output into data lines.
///
/// Only the single empty line left behind by the final terminator is
/// dropped; empty lines in the middle of the output still count.
pub fn data_lines(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

/// Parse tool output into a [`Reading`].
///
/// A line whose leading token is not a base-10 integer (`"[N/A]"`,
/// `"[Not Supported]"`) contributes `0` instead of failing the batch.
pub fn parse_reading(output: &str) -> SmiResult<Reading> {
    let lines = data_lines(output);
    if lines.is_empty() {
        return Err(SmiError::EmptyResult);
    }

    let mut sum: i64 = 0;
    let mut raw_unit = String::new();

    for line in &lines {
        let mut tokens = line.split_whitespace();
        let value = tokens
            .next()
            .and_then(|token| token.trim_end_matches(',').parse::<i64>().ok())
            .unwrap_or(0);
        if let Some(unit) = tokens.next() {
            raw_unit = unit.to_string();
        }
        sum = sum.saturating_add(value);
    }

    Ok(Reading {
        value: sum / lines.len() as i64,
        raw_unit,
    })
}
