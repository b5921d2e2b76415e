//! Error taxonomy for the curation engine.
//!
//! The kinds below are not source types: they group failures by how the
//! caller must react (abort, degrade, retry, drop) rather than by which
//! library produced them. Most call sites use `anyhow::Result` with
//! `.context(...)`; code that must branch on how to react matches on
//! `EngineError` directly.

use std::fmt;

/// Error kinds, grouped by reaction policy rather than by source.
#[derive(Debug)]
pub enum EngineError {
    /// Required configuration missing or unparseable. Fatal at startup.
    ConfigMissing(String),
    /// A DB or external API call failed. Callers degrade to an empty default.
    ExternalUnavailable(String),
    /// A stored record could not be parsed. Drop the record, log, continue.
    DataFormat(String),
    /// A rule panicked or returned an error. Isolated to that rule.
    RuleFailure { rule: String, reason: String },
    /// Persistence integrity could not be guaranteed after retries.
    IntegrityViolation(String),
    /// The caller went away. Propagate without logging as an error.
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigMissing(what) => write!(f, "missing configuration: {}", what),
            Self::ExternalUnavailable(what) => write!(f, "external dependency unavailable: {}", what),
            Self::DataFormat(what) => write!(f, "malformed record: {}", what),
            Self::RuleFailure { rule, reason } => write!(f, "rule '{}' failed: {}", rule, reason),
            Self::IntegrityViolation(what) => write!(f, "persistence integrity violation: {}", what),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::ExternalUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::ExternalUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataFormat(e.to_string())
    }
}

/// Extracts a human-readable message from a caught panic payload, for
/// building a [`EngineError::RuleFailure`] reason. Panics conventionally
/// carry a `&str` or `String`; anything else gets a generic fallback.
pub fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_rule_name() {
        let err = EngineError::RuleFailure {
            rule: "ExcludeSeenItems".to_string(),
            reason: "boom".to_string(),
        };
        assert!(err.to_string().contains("ExcludeSeenItems"));
    }
}
