//! Pipeline configuration with sane defaults, loadable from TOML.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::error::PipelineError;
use crate::rules;

/// Upper bound on worker threads for parsing and aggregation.
pub const MAX_WORKERS: usize = 256;

/// Which (service, severity, signature) combinations the aggregator counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSpec {
  Service,
  ServiceSeverity,
  ServiceSignature,
  ServiceSeveritySignature,
}

/// Detection thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
  /// Deviation at or above which an exceedance is reported with MEDIUM confidence.
  pub medium: f64,
  /// Deviation at or above which an exceedance is reported with HIGH confidence.
  pub high: f64,
  /// Floor for the variability divisor.
  pub epsilon: f64,
  /// Max evidence events attached to one anomaly.
  pub evidence_cap: usize,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      medium: 2.0,
      high: 3.0,
      epsilon: 1e-3,
      evidence_cap: 5,
    }
  }
}

/// One pattern rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternSpec {
  pub id: String,
  pub regex: String,
  /// Event field -> capture group name. Fields left out fall back to a same-named group.
  #[serde(default)]
  pub fields: BTreeMap<String, String>,
  /// chrono strftime format tried before the generic timestamp formats.
  #[serde(default)]
  pub timestamp_format: Option<String>,
}

/// One error-signature classifier entry: any keyword hit (case-insensitive) yields `code`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignatureSpec {
  pub code: String,
  pub keywords: Vec<String>,
}

/// Tunables for one pipeline run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Aggregation window size (epoch aligned).
  #[serde(deserialize_with = "de_duration")]
  pub window: Duration,
  /// Slack allowed between anomaly windows when grouping hypotheses.
  #[serde(deserialize_with = "de_duration")]
  pub correlation_window: Duration,
  /// Wall-clock budget for one run, checked between stages.
  #[serde(deserialize_with = "de_opt_duration")]
  pub deadline: Option<Duration>,
  /// Worker threads for parsing and aggregation.
  pub workers: usize,
  /// Cap on events copied into the report.
  pub max_report_events: Option<usize>,
  pub dimensions: BTreeSet<DimensionSpec>,
  pub thresholds: Thresholds,
  /// Ordered; first matching rule wins.
  pub patterns: Vec<PatternSpec>,
  /// Ordered; first matching entry wins.
  pub signatures: Vec<SignatureSpec>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      window: Duration::from_secs(3600),
      correlation_window: Duration::ZERO,
      deadline: None,
      workers: 1,
      max_report_events: None,
      dimensions: [DimensionSpec::ServiceSeverity, DimensionSpec::ServiceSeveritySignature]
        .into_iter()
        .collect(),
      thresholds: Thresholds::default(),
      patterns: rules::builtin_patterns(),
      signatures: rules::builtin_signatures(),
    }
  }
}

impl Config {
  /// Parse and validate a TOML document. Omitted keys keep their defaults.
  pub fn from_toml_str(s: &str) -> Result<Self, PipelineError> {
    let config: Config = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| PipelineError::config("path", format!("{}: {}", path.display(), e)))?;
    Self::from_toml_str(&text)
  }

  /// Reject configurations that cannot produce a meaningful run.
  /// Pattern regexes are checked separately when the rule table is compiled.
  pub fn validate(&self) -> Result<(), PipelineError> {
    if self.window.as_secs() == 0 {
      return Err(PipelineError::config("window", "must be at least one second"));
    }
    if self.window.as_secs() > i64::MAX as u64 {
      return Err(PipelineError::config("window", "is out of range"));
    }
    if self.workers == 0 || self.workers > MAX_WORKERS {
      return Err(PipelineError::config(
        "workers",
        format!("must be between 1 and {}", MAX_WORKERS),
      ));
    }
    if self.dimensions.is_empty() {
      return Err(PipelineError::config("dimensions", "at least one dimension is required"));
    }
    if self.patterns.is_empty() {
      return Err(PipelineError::config("patterns", "at least one pattern rule is required"));
    }

    let t = &self.thresholds;
    if !(t.medium.is_finite() && t.medium > 0.0) {
      return Err(PipelineError::config("thresholds.medium", "must be a positive number"));
    }
    if !(t.high.is_finite() && t.high >= t.medium) {
      return Err(PipelineError::config("thresholds.high", "must be >= thresholds.medium"));
    }
    if !(t.epsilon.is_finite() && t.epsilon > 0.0) {
      return Err(PipelineError::config("thresholds.epsilon", "must be a positive number"));
    }
    if t.evidence_cap == 0 {
      return Err(PipelineError::config("thresholds.evidence_cap", "must be at least 1"));
    }

    for sig in &self.signatures {
      if sig.code.trim().is_empty() {
        return Err(PipelineError::config("signatures.code", "must not be empty"));
      }
    }
    Ok(())
  }
}

/// Parse a duration like `90s`, `15m`, `1h`, `2d`, `1w`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, PipelineError> {
  let s = s.trim().to_ascii_lowercase();
  let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
  let (digits, unit) = s.split_at(split);
  let value: u64 = digits
    .parse()
    .map_err(|_| PipelineError::config("duration", format!("invalid duration `{}`", s)))?;
  let secs_per_unit = match unit.trim() {
    "" | "s" => 1,
    "m" => 60,
    "h" => 3600,
    "d" => 86_400,
    "w" => 604_800,
    other => {
      return Err(PipelineError::config(
        "duration",
        format!("unknown unit `{}` (expected s|m|h|d|w)", other),
      ))
    }
  };
  let secs = value
    .checked_mul(secs_per_unit)
    .ok_or_else(|| PipelineError::config("duration", format!("duration `{}` is out of range", s)))?;
  Ok(Duration::from_secs(secs))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
  Secs(u64),
  Text(String),
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
  match RawDuration::deserialize(d)? {
    RawDuration::Secs(s) => Ok(Duration::from_secs(s)),
    RawDuration::Text(t) => parse_duration(&t).map_err(serde::de::Error::custom),
  }
}

fn de_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
  de_duration(d).map(Some)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_duration_units() {
    assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
    assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
    assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
    assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
    assert!(parse_duration("1y").is_err());
    assert!(parse_duration("h").is_err());
  }

  #[test]
  fn defaults_are_valid() {
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn toml_overrides_keep_other_defaults() {
    let config = Config::from_toml_str(
      r#"
        window = "5m"
        correlation_window = 300
        dimensions = ["service", "service_signature"]

        [thresholds]
        high = 4.0
      "#,
    )
    .unwrap();
    assert_eq!(config.window, Duration::from_secs(300));
    assert_eq!(config.correlation_window, Duration::from_secs(300));
    assert_eq!(config.thresholds.high, 4.0);
    assert_eq!(config.thresholds.medium, 2.0);
    assert_eq!(config.thresholds.evidence_cap, 5);
    assert!(config.dimensions.contains(&DimensionSpec::ServiceSignature));
    assert!(!config.patterns.is_empty());
    assert_eq!(config.deadline, None);
  }

  #[test]
  fn custom_patterns_replace_builtins() {
    let config = Config::from_toml_str(
      r#"
        deadline = "30s"

        [[patterns]]
        id = "kv"
        regex = 'level=(?P<lvl>\w+) msg="(?P<message>[^"]*)"'
        fields = { severity = "lvl" }
      "#,
    )
    .unwrap();
    assert_eq!(config.patterns.len(), 1);
    assert_eq!(config.patterns[0].fields["severity"], "lvl");
    assert_eq!(config.deadline, Some(Duration::from_secs(30)));
  }

  #[test]
  fn rejects_inverted_thresholds() {
    let err = Config::from_toml_str("[thresholds]\nmedium = 5.0\nhigh = 3.0\n").unwrap_err();
    assert!(err.to_string().contains("thresholds.high"));
  }

  #[test]
  fn rejects_zero_window_and_zero_cap() {
    let err = Config::from_toml_str("window = 0").unwrap_err();
    assert!(err.to_string().contains("window"));
    let err = Config::from_toml_str("[thresholds]\nevidence_cap = 0\n").unwrap_err();
    assert!(err.to_string().contains("evidence_cap"));
  }

  #[test]
  fn oversized_durations_are_config_errors() {
    let err = parse_duration("30500000000000000w").unwrap_err();
    assert!(err.to_string().contains("out of range"));
    let err = Config::from_toml_str(r#"window = "30500000000000000w""#).unwrap_err();
    assert!(err.to_string().contains("out of range"));

    let config = Config {
      window: Duration::from_secs(u64::MAX),
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("window"));
  }

  #[test]
  fn workers_are_bounded() {
    assert!(Config::from_toml_str("workers = 256").is_ok());
    let err = Config::from_toml_str("workers = 257").unwrap_err();
    assert!(err.to_string().contains("workers"));
    assert!(Config::from_toml_str("workers = 0").is_err());
  }

  #[test]
  fn rejects_bad_duration_text() {
    let err = Config::from_toml_str(r#"window = "soon""#).unwrap_err();
    assert!(matches!(err, PipelineError::Toml(_)));
  }

  #[test]
  fn rejects_empty_pattern_table() {
    let err = Config::from_toml_str("patterns = []").unwrap_err();
    assert!(err.to_string().contains("patterns"));
  }
}
