//! Structured error types for the analysis pipeline.

use thiserror::Error;

use crate::types::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
  /// A single pattern rule is malformed. Fatal: raised before any input is read.
  #[error("config: rule {rule_id}: {reason}")]
  Rule { rule_id: String, reason: String },

  #[error("config: {field}: {reason}")]
  Config { field: String, reason: String },

  /// One line could not be fully parsed. Never aborts a run; rendered into warnings.
  #[error("parse: line {index}: {reason}")]
  Parse { index: usize, reason: String },

  #[error("deadline exceeded before {stage}")]
  DeadlineExceeded { stage: Stage },

  #[error("worker: {0}")]
  Worker(String),

  #[error("toml: {0}")]
  Toml(#[from] toml::de::Error),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl PipelineError {
  pub fn rule(rule_id: &str, reason: impl Into<String>) -> Self {
    Self::Rule {
      rule_id: rule_id.to_string(),
      reason: reason.into(),
    }
  }

  pub fn config(field: &str, reason: impl Into<String>) -> Self {
    Self::Config {
      field: field.to_string(),
      reason: reason.into(),
    }
  }

  pub fn parse(index: usize, reason: impl Into<String>) -> Self {
    Self::Parse {
      index,
      reason: reason.into(),
    }
  }

  /// Fatal errors stop the orchestrator; everything else degrades into a warning.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, Self::Parse { .. } | Self::DeadlineExceeded { .. })
  }

  /// The offending rule id, when the error is tied to one pattern rule.
  pub fn rule_id(&self) -> Option<&str> {
    match self {
      Self::Rule { rule_id, .. } => Some(rule_id),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rule_error_names_the_rule() {
    let err = PipelineError::rule("nginx", "unknown capture group `lvl`");
    assert_eq!(err.rule_id(), Some("nginx"));
    assert!(err.to_string().contains("nginx"));
    assert!(err.is_fatal());
  }

  #[test]
  fn parse_error_is_recoverable() {
    let err = PipelineError::parse(3, "no pattern rule matched");
    assert!(!err.is_fatal());
    assert_eq!(err.to_string(), "parse: line 3: no pattern rule matched");
  }
}
