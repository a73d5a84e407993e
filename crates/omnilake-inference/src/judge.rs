//! Parsing of validation judgments.

use regex::Regex;

use omnilake_core::{Error, Result};

/// Outcome of a validation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judgment {
    Success,
    Failure,
}

impl Judgment {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

const VERDICT_PATTERN: &str = r"^(SUCCESS|FAILURE)$";

/// Parse a model answer. After trimming and upper-casing it must be exactly
/// SUCCESS or FAILURE; anything else is an `Inference` error.
pub fn parse_judgment(answer: &str) -> Result<Judgment> {
    let verdict = Regex::new(VERDICT_PATTERN)
        .map_err(|e| Error::Internal(format!("verdict pattern: {}", e)))?;
    let normalized = answer.trim().to_uppercase();
    match verdict
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    {
        Some("SUCCESS") => Ok(Judgment::Success),
        Some("FAILURE") => Ok(Judgment::Failure),
        _ => Err(Error::Inference(format!(
            "Invalid validation response: {:?}",
            answer
        ))),
    }
}
