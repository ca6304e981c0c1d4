//! Run summary: headline numbers for a finished report.
//!
//! Pure function of the report; nothing here feeds back into detection.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{Confidence, ParsedEvent, Report, Status};

pub const TOP_SIGNATURES: usize = 10;
pub const EXAMPLE_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureStat {
  pub signature: String,
  pub count: usize,
  /// Share of error events, 0..=100.
  pub percentage: f64,
  /// Most recent message carrying the signature, truncated.
  pub example: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
  pub samples: usize,
  pub p50_ms: f64,
  pub p95_ms: f64,
  pub p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStat {
  pub service: String,
  pub total: usize,
  pub errors: usize,
  pub error_rate: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub latency: Option<LatencyStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
  pub status: Status,
  pub headline: String,
  pub total_events: usize,
  pub error_count: usize,
  pub error_rate: f64,
  pub top_signatures: Vec<SignatureStat>,
  pub services: Vec<ServiceStat>,
  pub anomaly_count: usize,
  pub anomalies_by_confidence: BTreeMap<Confidence, usize>,
  pub hypothesis_count: usize,
}

pub fn summarize(report: &Report) -> RunSummary {
  let events = &report.events;
  let errors: Vec<&ParsedEvent> = events.iter().filter(|e| e.severity.is_error()).collect();

  let mut anomalies_by_confidence = BTreeMap::new();
  for a in &report.anomalies {
    *anomalies_by_confidence.entry(a.confidence).or_insert(0) += 1;
  }

  RunSummary {
    status: report.status,
    headline: headline(report, errors.len()),
    total_events: events.len(),
    error_count: errors.len(),
    error_rate: ratio(errors.len(), events.len()),
    top_signatures: top_signatures(&errors),
    services: services(events),
    anomaly_count: report.anomalies.len(),
    anomalies_by_confidence,
    hypothesis_count: report.hypotheses.len(),
  }
}

fn ratio(part: usize, whole: usize) -> f64 {
  if whole == 0 {
    0.0
  } else {
    part as f64 / whole as f64
  }
}

fn headline(report: &Report, errors: usize) -> String {
  let pct = ratio(errors, report.events.len()) * 100.0;
  let high = report
    .anomalies
    .iter()
    .filter(|a| a.confidence == Confidence::High)
    .count();
  match report.anomalies.len() {
    0 => format!("no anomalies detected; error rate {:.1}%", pct),
    1 => format!("1 anomaly detected ({} high confidence); error rate {:.1}%", high, pct),
    n => format!("{} anomalies detected ({} high confidence); error rate {:.1}%", n, high, pct),
  }
}

fn top_signatures(errors: &[&ParsedEvent]) -> Vec<SignatureStat> {
  // signature -> (count, latest (timestamp, index), example)
  let mut by_sig: BTreeMap<&str, (usize, (i64, usize), &str)> = BTreeMap::new();
  for e in errors {
    let Some(sig) = e.error_signature.as_deref() else { continue };
    let at = (e.timestamp.timestamp(), e.index);
    let slot = by_sig.entry(sig).or_insert((0, at, e.message.as_str()));
    slot.0 += 1;
    if at >= slot.1 {
      slot.1 = at;
      slot.2 = e.message.as_str();
    }
  }

  let mut stats: Vec<SignatureStat> = by_sig
    .into_iter()
    .map(|(sig, (count, _, example))| SignatureStat {
      signature: sig.to_string(),
      count,
      percentage: ratio(count, errors.len()) * 100.0,
      example: example.chars().take(EXAMPLE_MAX_CHARS).collect(),
    })
    .collect();
  // Stable sort keeps the BTreeMap's name order among equal counts.
  stats.sort_by(|a, b| b.count.cmp(&a.count));
  stats.truncate(TOP_SIGNATURES);
  stats
}

fn services(events: &[ParsedEvent]) -> Vec<ServiceStat> {
  let mut by_service: BTreeMap<&str, (usize, usize, Vec<f64>)> = BTreeMap::new();
  for e in events {
    let slot = by_service.entry(e.service.as_str()).or_default();
    slot.0 += 1;
    if e.severity.is_error() {
      slot.1 += 1;
    }
    if let Some(ms) = e.attributes.get("latency_ms").and_then(|v| v.parse::<f64>().ok()) {
      if ms.is_finite() {
        slot.2.push(ms);
      }
    }
  }

  by_service
    .into_iter()
    .map(|(service, (total, errors, mut latencies))| {
      latencies.sort_by(|a, b| a.total_cmp(b));
      ServiceStat {
        service: service.to_string(),
        total,
        errors,
        error_rate: ratio(errors, total),
        latency: latency_stats(&latencies),
      }
    })
    .collect()
}

fn latency_stats(sorted: &[f64]) -> Option<LatencyStats> {
  if sorted.is_empty() {
    return None;
  }
  Some(LatencyStats {
    samples: sorted.len(),
    p50_ms: percentile(sorted, 50.0),
    p95_ms: percentile(sorted, 95.0),
    p99_ms: percentile(sorted, 99.0),
  })
}

/// Nearest-rank percentile over ascending, non-empty values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
  let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
  sorted[rank.clamp(1, sorted.len()) - 1]
}
