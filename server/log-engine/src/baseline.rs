//! Baseline capability: read-only historical expectations per dimension key.
//!
//! The pipeline only reads through `BaselineLookup`; where the numbers live is up
//! to the caller. Reads must stay consistent for the length of one run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::PipelineError;
use crate::types::{DimensionKey, WILDCARD};

/// Which bucket value a baseline entry describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMetric {
  /// Events per window.
  #[default]
  Count,
  /// Events per second.
  Rate,
  /// Fraction of the window's events.
  Share,
}

impl BaselineMetric {
  pub fn is_rate(self) -> bool {
    !matches!(self, Self::Count)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
  pub expected: f64,
  /// Spread of historical values (standard deviation or similar).
  pub variability: f64,
  #[serde(default)]
  pub metric: BaselineMetric,
}

impl BaselineEntry {
  pub fn count(expected: f64, variability: f64) -> Self {
    Self {
      expected,
      variability,
      metric: BaselineMetric::Count,
    }
  }
}

pub trait BaselineLookup {
  fn get(&self, key: &DimensionKey) -> Option<BaselineEntry>;

  /// Whether `signature` has been seen for `service` before. Defaults to the
  /// presence of a `(service, *, signature)` series.
  fn knows_signature(&self, service: &str, signature: &str) -> bool {
    self.get(&DimensionKey::new(service, WILDCARD, signature)).is_some()
  }
}

/// Map-backed baseline, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryBaseline {
  entries: BTreeMap<DimensionKey, BaselineEntry>,
  signatures: BTreeSet<(String, String)>,
}

#[derive(Deserialize)]
struct BaselineFile {
  #[serde(default)]
  entries: Vec<FileEntry>,
  #[serde(default)]
  known_signatures: Vec<KnownSignature>,
}

#[derive(Deserialize)]
struct FileEntry {
  service: String,
  #[serde(default = "wildcard")]
  severity: String,
  #[serde(default = "wildcard")]
  signature: String,
  #[serde(flatten)]
  entry: BaselineEntry,
}

#[derive(Deserialize)]
struct KnownSignature {
  service: String,
  signature: String,
}

fn wildcard() -> String {
  WILDCARD.to_string()
}

impl InMemoryBaseline {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_entry(mut self, key: DimensionKey, entry: BaselineEntry) -> Self {
    self.entries.insert(key, entry);
    self
  }

  pub fn with_signature(mut self, service: &str, signature: &str) -> Self {
    self.signatures.insert((service.to_string(), signature.to_string()));
    self
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Load from `{"entries": [...], "known_signatures": [...]}`.
  pub fn from_json(s: &str) -> Result<Self, PipelineError> {
    let file: BaselineFile = serde_json::from_str(s)?;
    let mut baseline = Self::new();
    for e in file.entries {
      let key = DimensionKey::new(e.service, e.severity, e.signature);
      if !e.entry.expected.is_finite() || !e.entry.variability.is_finite() || e.entry.variability < 0.0 {
        return Err(PipelineError::config(
          "baseline",
          format!("entry {} needs finite expected and non-negative variability", key),
        ));
      }
      baseline.entries.insert(key, e.entry);
    }
    for s in file.known_signatures {
      baseline.signatures.insert((s.service, s.signature));
    }
    Ok(baseline)
  }
}

impl BaselineLookup for InMemoryBaseline {
  fn get(&self, key: &DimensionKey) -> Option<BaselineEntry> {
    self.entries.get(key).copied()
  }

  fn knows_signature(&self, service: &str, signature: &str) -> bool {
    self
      .signatures
      .contains(&(service.to_string(), signature.to_string()))
      || self
        .entries
        .keys()
        .any(|k| k.service == service && k.signature == signature)
  }
}
