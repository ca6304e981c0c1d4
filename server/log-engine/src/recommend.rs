//! Investigation checklist per anomaly. Suggestions only; nothing is remediated.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{Anomaly, AnomalyKind, Confidence, Hypothesis};

pub const MAX_ACTIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
  pub anomaly_id: String,
  /// Ids of hypotheses that group this anomaly.
  pub hypothesis_ids: Vec<String>,
  pub priority: Confidence,
  pub category: &'static str,
  pub actions: Vec<String>,
}

fn kind_template(kind: AnomalyKind) -> (&'static str, &'static [&'static str]) {
  match kind {
    AnomalyKind::Spike | AnomalyKind::RateIncrease => (
      "investigation",
      &[
        "Check recent deployments that might have introduced the regression",
        "Review application logs for the affected window",
        "Check for upstream service issues",
        "Enable real-time error rate alerts",
      ],
    ),
    AnomalyKind::NewSignature => (
      "investigation",
      &[
        "Check if related code was recently modified",
        "Review the error message for root cause hints",
        "Add an alert rule for this signature",
      ],
    ),
    AnomalyKind::MissingBaseline => (
      "monitoring",
      &[
        "Record a baseline for this series so deviations can be scored",
        "Set up a dashboard for this series",
      ],
    ),
  }
}

fn signature_hints(signature: &str) -> &'static [&'static str] {
  match signature {
    "DB_TIMEOUT" => &["Verify database connection pool configuration", "Check slow query logs"],
    "TIMEOUT" | "CONNECTION_REFUSED" => &["Review network latency and health of downstream services"],
    "AUTH_FAILED" | "FORBIDDEN" => &["Check identity provider health and credential rotation"],
    "RATE_LIMIT" => &["Review client request volume against configured limits"],
    "OOM" => &["Analyze memory utilization and recent heap growth"],
    _ => &[],
  }
}

/// One recommendation per anomaly, highest priority first.
pub fn recommend(anomalies: &[Anomaly], hypotheses: &[Hypothesis]) -> Vec<Recommendation> {
  let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
  for h in hypotheses {
    for r in &h.anomaly_refs {
      grouped.entry(r.as_str()).or_default().push(h.id.clone());
    }
  }

  let mut out: Vec<Recommendation> = anomalies
    .iter()
    .map(|a| {
      let (category, base) = kind_template(a.kind);
      let mut actions: Vec<String> = a
        .dimension_key
        .signature()
        .map(signature_hints)
        .unwrap_or(&[])
        .iter()
        .chain(base.iter())
        .map(|s| s.to_string())
        .collect();
      actions.dedup();
      actions.truncate(MAX_ACTIONS);
      let mut hypothesis_ids = grouped.get(a.id.as_str()).cloned().unwrap_or_default();
      hypothesis_ids.sort();
      Recommendation {
        anomaly_id: a.id.clone(),
        hypothesis_ids,
        priority: a.confidence,
        category,
        actions,
      }
    })
    .collect();
  out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.anomaly_id.cmp(&b.anomaly_id)));
  out
}
