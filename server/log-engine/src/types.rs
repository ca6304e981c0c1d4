//! Core types for the analysis pipeline (input records, stage artifacts, report contract).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PipelineError;

/// Dimension value meaning "all values" (severity or signature not split out).
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Inbound types (what the fetch collaborator hands us)
// ---------------------------------------------------------------------------

/// One raw log line. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
  pub source: String,
  pub text: String,
  pub ingested_at: DateTime<Utc>,
}

impl LogLine {
  pub fn new(source: impl Into<String>, text: impl Into<String>, ingested_at: DateTime<Utc>) -> Self {
    Self {
      source: source.into(),
      text: text.into(),
      ingested_at,
    }
  }
}

// ---------------------------------------------------------------------------
// Severity enum (normalized)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Unknown,
}

impl Severity {
  /// Loose token match; `None` when the token is not a recognised level.
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "trace" | "debug" | "dbg" => Some(Self::Debug),
      "info" | "notice" | "inf" => Some(Self::Info),
      "warn" | "warning" | "wrn" => Some(Self::Warn),
      "error" | "err" => Some(Self::Error),
      "fatal" | "critical" | "crit" | "panic" | "emerg" | "alert" => Some(Self::Fatal),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Debug => "DEBUG",
      Self::Info => "INFO",
      Self::Warn => "WARN",
      Self::Error => "ERROR",
      Self::Fatal => "FATAL",
      Self::Unknown => "UNKNOWN",
    }
  }

  pub fn is_error(self) -> bool {
    matches!(self, Self::Error | Self::Fatal)
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ---------------------------------------------------------------------------
// Parsed events
// ---------------------------------------------------------------------------

/// Canonical record produced for every input line, matched or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedEvent {
  /// Position of the originating line in the run's input.
  pub index: usize,
  pub source: String,
  pub timestamp: DateTime<Utc>,
  /// Set when the line carried no usable timestamp and ingestion time was used.
  pub timestamp_inferred: bool,
  pub service: String,
  pub severity: Severity,
  pub message: String,
  pub error_signature: Option<String>,
  pub raw: String,
  pub source_pattern_id: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attributes: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// One metric series: (service, severity, error_signature), each possibly `*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
  pub service: String,
  pub severity: String,
  pub signature: String,
}

impl DimensionKey {
  pub fn new(service: impl Into<String>, severity: impl Into<String>, signature: impl Into<String>) -> Self {
    Self {
      service: service.into(),
      severity: severity.into(),
      signature: signature.into(),
    }
  }

  /// The synthetic per-window total series.
  pub fn total() -> Self {
    Self::new(WILDCARD, WILDCARD, WILDCARD)
  }

  pub fn is_total(&self) -> bool {
    self.service == WILDCARD && self.severity == WILDCARD && self.signature == WILDCARD
  }

  pub fn signature(&self) -> Option<&str> {
    (self.signature != WILDCARD).then_some(self.signature.as_str())
  }
}

impl fmt::Display for DimensionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.service, self.severity, self.signature)
  }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Window {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

impl Window {
  pub fn contains(&self, ts: DateTime<Utc>) -> bool {
    self.start <= ts && ts < self.end
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricBucket {
  pub window: Window,
  pub key: DimensionKey,
  pub count: u64,
  /// Events per second of window.
  pub rate: f64,
  /// Fraction of the window's total events.
  pub share: f64,
  /// Input indices of contributing events, ascending.
  #[serde(skip)]
  pub members: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
  Low,
  Medium,
  High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
  Spike,
  NewSignature,
  RateIncrease,
  MissingBaseline,
}

impl AnomalyKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Spike => "SPIKE",
      Self::NewSignature => "NEW_SIGNATURE",
      Self::RateIncrease => "RATE_INCREASE",
      Self::MissingBaseline => "MISSING_BASELINE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
  pub id: String,
  pub dimension_key: DimensionKey,
  pub kind: AnomalyKind,
  pub observed_value: f64,
  pub expected_value: f64,
  pub deviation_score: f64,
  pub confidence: Confidence,
  /// Most recent first, at most `evidence_cap` entries.
  pub evidence: Vec<ParsedEvent>,
  pub window: Window,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hypothesis {
  pub id: String,
  pub service: String,
  /// Span covered by the grouped anomalies.
  pub window: Window,
  pub anomaly_refs: Vec<String>,
  pub signatures: Vec<String>,
  pub statement: String,
  pub confidence: Confidence,
  /// Input indices of the events backing the grouped anomalies.
  pub evidence_refs: Vec<usize>,
  /// Facts about the group that weaken the hypothesis.
  pub uncertainty_factors: Vec<String>,
  /// Checks an operator can run to confirm or reject it.
  pub suggested_validation: Vec<String>,
}

// ---------------------------------------------------------------------------
// Run status + report (what SUMMARIZE/RECOMMEND consume)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
  Discover,
  Fetch,
  Parse,
  Aggregate,
  Detect,
  Hypothesize,
  Summarize,
  Recommend,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Discover => "DISCOVER",
      Self::Fetch => "FETCH",
      Self::Parse => "PARSE",
      Self::Aggregate => "AGGREGATE",
      Self::Detect => "DETECT",
      Self::Hypothesize => "HYPOTHESIZE",
      Self::Summarize => "SUMMARIZE",
      Self::Recommend => "RECOMMEND",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
  Ok,
  Partial,
  Timeout,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
  pub stage: Stage,
  pub cause: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rule_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
  pub status: Status,
  pub events: Vec<ParsedEvent>,
  pub metrics: Vec<MetricBucket>,
  pub anomalies: Vec<Anomaly>,
  pub hypotheses: Vec<Hypothesis>,
  pub warnings: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<Failure>,
}

impl Report {
  pub fn empty(status: Status) -> Self {
    Self {
      status,
      events: Vec::new(),
      metrics: Vec::new(),
      anomalies: Vec::new(),
      hypotheses: Vec::new(),
      warnings: Vec::new(),
      failure: None,
    }
  }

  /// A report for a run stopped by a fatal error in `stage`.
  pub fn failed(stage: Stage, err: &PipelineError) -> Self {
    let mut report = Self::empty(Status::Failed);
    report.failure = Some(Failure {
      stage,
      cause: err.to_string(),
      rule_id: err.rule_id().map(str::to_string),
    });
    report
  }
}
