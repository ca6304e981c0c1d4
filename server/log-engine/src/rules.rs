//! Compiled rule tables: the ordered pattern rules and the error-signature classifier.
//!
//! Rules are evaluated in configured order and the first match wins.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{PatternSpec, SignatureSpec};
use crate::error::PipelineError;

/// Signature assigned to error events no classifier entry recognises.
pub const GENERIC_SIGNATURE: &str = "GENERIC_ERROR";

/// Event fields an extraction directive may target.
pub const FIELDS: [&str; 5] = ["timestamp", "severity", "service", "message", "signature"];

const LEVELS: &str = "TRACE|DEBUG|INFO|NOTICE|WARNING|WARN|ERROR|ERR|FATAL|CRITICAL|CRIT|PANIC";

/// Default rule table, most specific first.
pub fn builtin_patterns() -> Vec<PatternSpec> {
  let iso = r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?";
  vec![
    // 2025-01-15T10:05:00Z ERROR [auth-service] Database timeout after 5000ms
    PatternSpec {
      id: "iso_level".into(),
      regex: format!(
        r"^(?P<timestamp>{iso})\s+\[?(?P<severity>{LEVELS})\]?\s*:?\s+(?:\[(?P<service>[A-Za-z0-9_.\-]+)\]\s*:?\s*)?(?P<message>.*)$"
      ),
      fields: BTreeMap::new(),
      timestamp_format: None,
    },
    // [15/Jan/2025:10:05:00 +0000] [ERROR] upstream timed out
    PatternSpec {
      id: "bracketed".into(),
      regex: format!(r"^\[(?P<timestamp>[^\]]+)\]\s+\[?(?P<severity>{LEVELS})\]?\s*:?\s+(?P<message>.*)$"),
      fields: BTreeMap::new(),
      timestamp_format: None,
    },
    // ERROR: connection refused
    PatternSpec {
      id: "level_prefix".into(),
      regex: format!(r"^(?P<severity>{LEVELS})\s*:?\s+(?P<message>.*)$"),
      fields: BTreeMap::new(),
      timestamp_format: None,
    },
  ]
}

/// Default classifier table. Specific codes precede the generic ones they overlap
/// (`DB_TIMEOUT` before `TIMEOUT`).
pub fn builtin_signatures() -> Vec<SignatureSpec> {
  let entry = |code: &str, keywords: &[&str]| SignatureSpec {
    code: code.into(),
    keywords: keywords.iter().map(|k| k.to_string()).collect(),
  };
  vec![
    entry("DB_TIMEOUT", &["database timeout", "db timeout", "query timeout", "database connection timed out"]),
    entry("CONNECTION_REFUSED", &["connection refused", "connection reset"]),
    entry("TIMEOUT", &["timeout", "timed out"]),
    entry("AUTH_FAILED", &["authentication failed", "auth failed", "unauthorized", "invalid credentials"]),
    entry("RATE_LIMIT", &["rate limit", "too many requests"]),
    entry("OOM", &["out of memory", "oomkilled", "oom killer", "memory error"]),
    entry("NULL_POINTER", &["null pointer", "nullpointer"]),
    entry("VALIDATION_ERROR", &["validation", "invalid input", "bad request"]),
    entry("FORBIDDEN", &["forbidden", "access denied", "permission denied"]),
    entry("NOT_FOUND", &["not found", "missing resource"]),
  ]
}

/// Capture-group names per event field for one rule.
#[derive(Debug, Clone, Default)]
struct Extraction {
  timestamp: Option<String>,
  severity: Option<String>,
  service: Option<String>,
  message: Option<String>,
  signature: Option<String>,
}

impl Extraction {
  fn slot(&mut self, field: &str) -> Option<&mut Option<String>> {
    match field {
      "timestamp" => Some(&mut self.timestamp),
      "severity" => Some(&mut self.severity),
      "service" => Some(&mut self.service),
      "message" => Some(&mut self.message),
      "signature" => Some(&mut self.signature),
      _ => None,
    }
  }
}

/// Field values pulled out of one matching line. Empty captures count as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extracted<'t> {
  pub timestamp: Option<&'t str>,
  pub severity: Option<&'t str>,
  pub service: Option<&'t str>,
  pub message: Option<&'t str>,
  pub signature: Option<&'t str>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
  id: String,
  regex: Regex,
  extraction: Extraction,
  timestamp_format: Option<String>,
}

impl CompiledRule {
  fn compile(spec: &PatternSpec) -> Result<Self, PipelineError> {
    let regex = Regex::new(&spec.regex)
      .map_err(|e| PipelineError::rule(&spec.id, format!("invalid regex: {}", e)))?;
    let groups: BTreeSet<&str> = regex.capture_names().flatten().collect();

    let mut extraction = Extraction::default();
    for (field, group) in &spec.fields {
      let slot = extraction.slot(field).ok_or_else(|| {
        PipelineError::rule(
          &spec.id,
          format!("unknown field `{}` (expected one of {})", field, FIELDS.join("|")),
        )
      })?;
      if !groups.contains(group.as_str()) {
        return Err(PipelineError::rule(
          &spec.id,
          format!("field `{}` names missing capture group `{}`", field, group),
        ));
      }
      *slot = Some(group.clone());
    }
    for field in FIELDS {
      if let Some(slot) = extraction.slot(field) {
        if slot.is_none() && groups.contains(field) {
          *slot = Some(field.to_string());
        }
      }
    }

    Ok(Self {
      id: spec.id.clone(),
      regex,
      extraction,
      timestamp_format: spec.timestamp_format.clone(),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn timestamp_format(&self) -> Option<&str> {
    self.timestamp_format.as_deref()
  }

  pub fn has_timestamp(&self) -> bool {
    self.extraction.timestamp.is_some()
  }

  /// Match the line and pull out the directed fields; `None` if the rule does not match.
  pub fn extract<'t>(&self, text: &'t str) -> Option<Extracted<'t>> {
    let caps = self.regex.captures(text)?;
    let e = &self.extraction;
    Some(Extracted {
      timestamp: group(&caps, &e.timestamp),
      severity: group(&caps, &e.severity),
      service: group(&caps, &e.service),
      message: group(&caps, &e.message),
      signature: group(&caps, &e.signature),
    })
  }
}

fn group<'t>(caps: &Captures<'t>, name: &Option<String>) -> Option<&'t str> {
  let name = name.as_deref()?;
  caps
    .name(name)
    .map(|m| m.as_str().trim())
    .filter(|s| !s.is_empty())
}

/// Keyword classifier for error messages: first entry with a keyword hit wins.
#[derive(Debug, Clone)]
pub struct SignatureClassifier {
  entries: Vec<(String, Vec<String>)>,
}

impl SignatureClassifier {
  pub fn new(specs: &[SignatureSpec]) -> Self {
    let entries = specs
      .iter()
      .map(|s| {
        let keywords = s
          .keywords
          .iter()
          .map(|k| k.to_lowercase())
          .filter(|k| !k.is_empty())
          .collect();
        (s.code.trim().to_ascii_uppercase(), keywords)
      })
      .collect();
    Self { entries }
  }

  pub fn classify(&self, message: &str) -> String {
    let lower = message.to_lowercase();
    self
      .entries
      .iter()
      .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k.as_str())))
      .map(|(code, _)| code.clone())
      .unwrap_or_else(|| GENERIC_SIGNATURE.to_string())
  }
}

/// Everything the parser needs, compiled once per pipeline.
#[derive(Debug, Clone)]
pub struct Ruleset {
  rules: Vec<CompiledRule>,
  classifier: SignatureClassifier,
  latency: Regex,
  error_code: Regex,
  percentage: Regex,
}

impl Ruleset {
  /// Compile the ordered rule table. Fails on the first malformed rule, naming it.
  pub fn compile(patterns: &[PatternSpec], signatures: &[SignatureSpec]) -> Result<Self, PipelineError> {
    let mut seen = BTreeSet::new();
    let mut rules = Vec::with_capacity(patterns.len());
    for spec in patterns {
      if spec.id.trim().is_empty() {
        return Err(PipelineError::config("patterns.id", "rule id must not be empty"));
      }
      if !seen.insert(spec.id.as_str()) {
        return Err(PipelineError::rule(&spec.id, "duplicate rule id"));
      }
      rules.push(CompiledRule::compile(spec)?);
    }

    Ok(Self {
      rules,
      classifier: SignatureClassifier::new(signatures),
      latency: builtin_regex("latency_ms", r"(\d+)\s*ms\b")?,
      error_code: builtin_regex("error_code", r"\bE\d{4}\b")?,
      percentage: builtin_regex("percentage", r"(\d+)%")?,
    })
  }

  pub fn rules(&self) -> &[CompiledRule] {
    &self.rules
  }

  pub fn classify(&self, message: &str) -> String {
    self.classifier.classify(message)
  }

  /// Metadata pulled from free text: latency, error codes, percentages.
  pub fn attributes(&self, message: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(c) = self.latency.captures(message) {
      out.insert("latency_ms".to_string(), c[1].to_string());
    }
    if let Some(m) = self.error_code.find(message) {
      out.insert("error_code".to_string(), m.as_str().to_string());
    }
    if let Some(c) = self.percentage.captures(message) {
      out.insert("percentage".to_string(), c[1].to_string());
    }
    out
  }
}

fn builtin_regex(name: &str, pattern: &str) -> Result<Regex, PipelineError> {
  Regex::new(pattern).map_err(|e| PipelineError::config(name, e.to_string()))
}
