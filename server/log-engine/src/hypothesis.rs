//! Hypothesis engine: group co-temporal anomalies on the same service.
//!
//! One sort plus one sweep: anomalies ordered by (service, window start) join the
//! running group while their window starts before the group's end plus the
//! correlation window. Statements name signatures but never a causal direction.
//! Wildcard-service series (the synthetic total) are never grouped: their
//! evidence spans services.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::fingerprint;
use crate::rules::GENERIC_SIGNATURE;
use crate::types::{Anomaly, AnomalyKind, Confidence, Hypothesis, Window, WILDCARD};

/// Statement used when no recognised signature backs a group.
pub const INSUFFICIENT_EVIDENCE: &str = "insufficient evidence to determine cause";

/// Groups backed by fewer evidence events than this are flagged as thinly supported.
pub const MIN_EVIDENCE: usize = 3;

/// Group anomalies into ranked hypotheses. Anomalies without evidence or on a
/// wildcard service are ignored.
pub fn hypothesize(anomalies: &[Anomaly], correlation_window: Duration) -> Vec<Hypothesis> {
  let slack = correlation_window.as_secs().min(i64::MAX as u64) as i64;

  let mut candidates: Vec<&Anomaly> = anomalies
    .iter()
    .filter(|a| !a.evidence.is_empty() && a.dimension_key.service != WILDCARD)
    .collect();
  candidates.sort_by(|a, b| {
    a.dimension_key
      .service
      .cmp(&b.dimension_key.service)
      .then_with(|| a.window.start.cmp(&b.window.start))
      .then_with(|| a.id.cmp(&b.id))
  });

  let mut groups: Vec<Vec<&Anomaly>> = Vec::new();
  let mut group_end = i64::MIN;
  for anomaly in candidates {
    let joins = match groups.last() {
      Some(group) => {
        group[0].dimension_key.service == anomaly.dimension_key.service
          && anomaly.window.start.timestamp() < group_end.saturating_add(slack)
      }
      None => false,
    };
    match groups.last_mut() {
      Some(group) if joins => {
        group.push(anomaly);
        group_end = group_end.max(anomaly.window.end.timestamp());
      }
      _ => {
        groups.push(vec![anomaly]);
        group_end = anomaly.window.end.timestamp();
      }
    }
  }

  let mut hypotheses: Vec<Hypothesis> = groups.iter().map(|g| build(g)).collect();
  hypotheses.sort_by(|a, b| {
    b.confidence
      .cmp(&a.confidence)
      .then_with(|| b.anomaly_refs.len().cmp(&a.anomaly_refs.len()))
      .then_with(|| a.id.cmp(&b.id))
  });
  hypotheses
}

fn build(group: &[&Anomaly]) -> Hypothesis {
  let service = group[0].dimension_key.service.clone();
  let window = Window {
    start: group.iter().map(|a| a.window.start).min().unwrap_or(group[0].window.start),
    end: group.iter().map(|a| a.window.end).max().unwrap_or(group[0].window.end),
  };

  let mut anomaly_refs: Vec<String> = group.iter().map(|a| a.id.clone()).collect();
  anomaly_refs.sort();
  anomaly_refs.dedup();

  let mut signatures = BTreeSet::new();
  let mut evidence_refs = BTreeSet::new();
  for a in group {
    if let Some(sig) = a.dimension_key.signature() {
      signatures.insert(sig.to_string());
    }
    for e in &a.evidence {
      evidence_refs.insert(e.index);
      if let Some(sig) = &e.error_signature {
        signatures.insert(sig.clone());
      }
    }
  }
  signatures.remove(GENERIC_SIGNATURE);
  let signatures: Vec<String> = signatures.into_iter().collect();

  let weakest = group.iter().map(|a| a.confidence).min().unwrap_or(Confidence::Low);
  let (statement, confidence) = if signatures.is_empty() {
    (INSUFFICIENT_EVIDENCE.to_string(), Confidence::Low)
  } else {
    (statement(&service, &window, group.len(), &signatures), weakest)
  };

  let evidence_refs: Vec<usize> = evidence_refs.into_iter().collect();
  let uncertainty_factors = uncertainty(group, evidence_refs.len(), signatures.is_empty());
  let suggested_validation = validation(&service, &signatures, group);

  Hypothesis {
    id: fingerprint::hypothesis_id(&anomaly_refs),
    service,
    window,
    anomaly_refs,
    signatures,
    statement,
    confidence,
    evidence_refs,
    uncertainty_factors,
    suggested_validation,
  }
}

fn uncertainty(group: &[&Anomaly], evidence_count: usize, no_signatures: bool) -> Vec<String> {
  let mut out = vec!["co-occurrence does not establish causation".to_string()];

  let unscored = group.iter().filter(|a| a.kind == AnomalyKind::MissingBaseline).count();
  if unscored > 0 {
    out.push(format!("{} of {} anomalies have no baseline; deviation unscored", unscored, group.len()));
  }
  if group.iter().any(|a| a.confidence == Confidence::Low) {
    out.push("includes low-confidence anomalies".to_string());
  }
  if group.iter().any(|a| a.kind == AnomalyKind::NewSignature) {
    out.push("a new signature may reflect a logging or parsing change rather than new behaviour".to_string());
  }
  if evidence_count < MIN_EVIDENCE {
    out.push(format!("only {} supporting event(s)", evidence_count));
  }
  let windows: BTreeSet<_> = group.iter().map(|a| a.window).collect();
  if windows.len() == 1 {
    out.push("observed in a single window".to_string());
  }
  if group.iter().any(|a| a.evidence.iter().any(|e| e.timestamp_inferred)) {
    out.push("some evidence is placed by ingestion time, not a logged timestamp".to_string());
  }
  if no_signatures {
    out.push("no recognised error signature".to_string());
  }
  out
}

fn signature_check(signature: &str, service: &str) -> String {
  match signature {
    "DB_TIMEOUT" => format!("Review slow query logs and connection pool metrics for {}", service),
    "CONNECTION_REFUSED" | "TIMEOUT" => format!("Check health and latency of services {} calls", service),
    "AUTH_FAILED" | "FORBIDDEN" => format!("Check identity provider logs and recent credential changes for {}", service),
    "RATE_LIMIT" => format!("Compare {} request volume with its configured limits", service),
    "OOM" => format!("Inspect memory usage and restarts of {} in the window", service),
    other => format!("Search recent code and configuration changes for {} on {}", other, service),
  }
}

fn validation(service: &str, signatures: &[String], group: &[&Anomaly]) -> Vec<String> {
  let mut out: Vec<String> = signatures.iter().map(|sig| signature_check(sig, service)).collect();
  if group.iter().any(|a| a.kind == AnomalyKind::MissingBaseline) {
    out.push(format!("Compare {} with the same window in earlier periods", service));
  }
  if group.iter().any(|a| a.kind == AnomalyKind::Spike || a.kind == AnomalyKind::RateIncrease) {
    out.push(format!("Check deployments and config changes to {} shortly before the window", service));
  }
  out
}

fn statement(service: &str, window: &Window, count: usize, signatures: &[String]) -> String {
  let (subject, verb) = if count == 1 {
    ("1 anomaly".to_string(), "involves")
  } else {
    (format!("{} co-occurring anomalies", count), "involve")
  };
  let noun = if signatures.len() == 1 { "signature" } else { "signatures" };
  format!(
    "{} on {} between {} and {} {} {} {}; any shared cause is unconfirmed (correlation only, causal direction not established)",
    subject,
    service,
    window.start.to_rfc3339(),
    window.end.to_rfc3339(),
    verb,
    noun,
    signatures.join(", "),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{AnomalyKind, DimensionKey, ParsedEvent, Severity, WILDCARD};
  use chrono::{TimeZone, Utc};

  fn window(hour: u32) -> Window {
    Window {
      start: Utc.with_ymd_and_hms(2025, 1, 15, hour, 0, 0).unwrap(),
      end: Utc.with_ymd_and_hms(2025, 1, 15, hour + 1, 0, 0).unwrap(),
    }
  }

  fn ev(index: usize, sig: Option<&str>) -> ParsedEvent {
    ParsedEvent {
      index,
      source: "s".into(),
      timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
      timestamp_inferred: false,
      service: "s".into(),
      severity: Severity::Error,
      message: "m".into(),
      error_signature: sig.map(str::to_string),
      raw: "m".into(),
      source_pattern_id: None,
      attributes: Default::default(),
    }
  }

  fn anomaly(
    id: &str,
    service: &str,
    sig: &str,
    hour: u32,
    confidence: Confidence,
    evidence: Vec<ParsedEvent>,
  ) -> Anomaly {
    Anomaly {
      id: id.into(),
      dimension_key: DimensionKey::new(service, "ERROR", sig),
      kind: AnomalyKind::Spike,
      observed_value: 9.0,
      expected_value: 1.0,
      deviation_score: 8.0,
      confidence,
      evidence,
      window: window(hour),
    }
  }

  #[test]
  fn groups_co_temporal_same_service() {
    let anomalies = vec![
      anomaly("a1", "auth", "DB_TIMEOUT", 10, Confidence::High, vec![ev(1, Some("DB_TIMEOUT"))]),
      anomaly("a2", "auth", "AUTH_FAILED", 10, Confidence::Medium, vec![ev(2, Some("AUTH_FAILED"))]),
      anomaly("a3", "billing", "OOM", 10, Confidence::High, vec![ev(3, Some("OOM"))]),
    ];
    let hyps = hypothesize(&anomalies, Duration::ZERO);
    assert_eq!(hyps.len(), 2);
    let auth = hyps.iter().find(|h| h.service == "auth").unwrap();
    assert_eq!(auth.anomaly_refs, vec!["a1".to_string(), "a2".to_string()]);
    assert_eq!(auth.signatures, vec!["AUTH_FAILED".to_string(), "DB_TIMEOUT".to_string()]);
    assert_eq!(auth.confidence, Confidence::Medium);
    assert_eq!(auth.evidence_refs, vec![1, 2]);
    assert!(auth.statement.contains("DB_TIMEOUT"));
    assert!(auth.statement.contains("AUTH_FAILED"));
    assert!(!auth.statement.contains("caused by"));
  }

  #[test]
  fn separate_windows_need_correlation_slack() {
    let anomalies = vec![
      anomaly("a1", "auth", "DB_TIMEOUT", 10, Confidence::High, vec![ev(1, None)]),
      anomaly("a2", "auth", "DB_TIMEOUT", 11, Confidence::High, vec![ev(2, None)]),
    ];
    assert_eq!(hypothesize(&anomalies, Duration::ZERO).len(), 2);
    assert_eq!(hypothesize(&anomalies, Duration::from_secs(60)).len(), 1);

    let far = vec![
      anomaly("a1", "auth", "DB_TIMEOUT", 8, Confidence::High, vec![ev(1, None)]),
      anomaly("a2", "auth", "DB_TIMEOUT", 11, Confidence::High, vec![ev(2, None)]),
    ];
    assert_eq!(hypothesize(&far, Duration::from_secs(3600)).len(), 2);
  }

  #[test]
  fn no_known_signature_is_insufficient_evidence() {
    let anomalies = vec![
      anomaly("a1", "auth", WILDCARD, 10, Confidence::High, vec![ev(1, None)]),
      anomaly("a2", "auth", GENERIC_SIGNATURE, 10, Confidence::High, vec![ev(2, Some(GENERIC_SIGNATURE))]),
    ];
    let hyps = hypothesize(&anomalies, Duration::ZERO);
    assert_eq!(hyps.len(), 1);
    assert_eq!(hyps[0].statement, INSUFFICIENT_EVIDENCE);
    assert_eq!(hyps[0].confidence, Confidence::Low);
    assert!(hyps[0].signatures.is_empty());
  }

  #[test]
  fn anomalies_without_evidence_are_skipped() {
    let anomalies = vec![anomaly("a1", "auth", "OOM", 10, Confidence::High, Vec::new())];
    assert!(hypothesize(&anomalies, Duration::ZERO).is_empty());
  }

  #[test]
  fn ranked_by_confidence_then_size() {
    let anomalies = vec![
      anomaly("a1", "a", "OOM", 10, Confidence::Low, vec![ev(1, None)]),
      anomaly("b1", "b", "OOM", 10, Confidence::High, vec![ev(2, None)]),
      anomaly("c1", "c", "OOM", 10, Confidence::High, vec![ev(3, None)]),
      anomaly("c2", "c", "TIMEOUT", 10, Confidence::High, vec![ev(4, None)]),
    ];
    let hyps = hypothesize(&anomalies, Duration::ZERO);
    let services: Vec<_> = hyps.iter().map(|h| h.service.as_str()).collect();
    assert_eq!(services, vec!["c", "b", "a"]);
  }

  #[test]
  fn empty_input() {
    assert!(hypothesize(&[], Duration::from_secs(60)).is_empty());
  }

  #[test]
  fn wildcard_service_is_not_grouped() {
    let evidence = vec![ev(1, Some("DB_TIMEOUT")), ev(2, Some("OOM"))];
    let mut total = anomaly("t1", WILDCARD, WILDCARD, 10, Confidence::Low, evidence);
    total.dimension_key = DimensionKey::total();
    total.kind = AnomalyKind::MissingBaseline;
    let anomalies = vec![
      total,
      anomaly("a1", "api", "DB_TIMEOUT", 10, Confidence::High, vec![ev(1, Some("DB_TIMEOUT"))]),
      anomaly("w1", "web", "OOM", 10, Confidence::High, vec![ev(2, Some("OOM"))]),
    ];
    let hyps = hypothesize(&anomalies, Duration::ZERO);
    assert_eq!(hyps.len(), 2);
    assert!(hyps.iter().all(|h| h.service != WILDCARD));
    assert!(hyps.iter().all(|h| h.signatures.len() == 1));
  }

  #[test]
  fn uncertainty_reflects_group_facts() {
    let evidence = vec![ev(2, Some("AUTH_FAILED"))];
    let mut unscored = anomaly("a2", "auth", "AUTH_FAILED", 10, Confidence::Low, evidence);
    unscored.kind = AnomalyKind::MissingBaseline;
    let anomalies = vec![
      anomaly("a1", "auth", "DB_TIMEOUT", 10, Confidence::High, vec![ev(1, Some("DB_TIMEOUT"))]),
      unscored,
    ];
    let h = &hypothesize(&anomalies, Duration::ZERO)[0];
    let factors = h.uncertainty_factors.join("\n");
    assert!(factors.contains("does not establish causation"));
    assert!(factors.contains("1 of 2 anomalies have no baseline"));
    assert!(factors.contains("low-confidence"));
    assert!(factors.contains("only 2 supporting event(s)"));
    assert!(factors.contains("single window"));
    assert!(!factors.contains("ingestion time"));

    assert!(h.suggested_validation[0].contains("identity provider"));
    assert!(h.suggested_validation[1].contains("slow query logs"));
    assert!(h.suggested_validation.iter().any(|v| v.contains("earlier periods")));
    assert!(h.suggested_validation.iter().any(|v| v.contains("deployments")));
  }

  #[test]
  fn well_supported_group_has_fewer_caveats() {
    let anomalies = vec![
      anomaly("a1", "auth", "OOM", 10, Confidence::High, vec![ev(1, Some("OOM")), ev(2, Some("OOM"))]),
      anomaly("a2", "auth", "OOM", 11, Confidence::High, vec![ev(3, Some("OOM"))]),
    ];
    let h = &hypothesize(&anomalies, Duration::from_secs(60))[0];
    assert_eq!(h.uncertainty_factors, vec!["co-occurrence does not establish causation".to_string()]);
    assert_eq!(h.suggested_validation.len(), 2);
  }
}
