//! Anomaly detection: compare metric buckets with baseline expectations.
//!
//! deviation = (observed - expected) / max(variability, epsilon). Only exceedances
//! are reported. A key with no baseline is reported as MISSING_BASELINE, never skipped.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::baseline::{BaselineEntry, BaselineLookup, BaselineMetric};
use crate::config::Thresholds;
use crate::fingerprint;
use crate::types::{Anomaly, AnomalyKind, Confidence, DimensionKey, MetricBucket, ParsedEvent, Window, WILDCARD};

/// Detect anomalies in `current`. `events` resolves bucket members into evidence.
///
/// Output is ranked by deviation desc, confidence desc, dimension key asc.
pub fn detect(
  current: &[MetricBucket],
  events: &[ParsedEvent],
  baseline: &dyn BaselineLookup,
  thresholds: &Thresholds,
) -> Vec<Anomaly> {
  let mut by_index: HashMap<usize, &ParsedEvent> = HashMap::with_capacity(events.len());
  for e in events {
    by_index.entry(e.index).or_insert(e);
  }

  let mut series: BTreeMap<&DimensionKey, Vec<&MetricBucket>> = BTreeMap::new();
  for bucket in current {
    series.entry(&bucket.key).or_default().push(bucket);
  }

  let mut anomalies = Vec::new();
  let mut flagged_signatures: BTreeSet<(Window, &str, &str)> = BTreeSet::new();

  for (key, mut buckets) in series {
    buckets.sort_by_key(|b| b.window);

    match baseline.get(key) {
      None => {
        if let Some(a) = missing_baseline(key, &buckets, &by_index, thresholds) {
          anomalies.push(a);
        }
      }
      Some(entry) => {
        for bucket in &buckets {
          if let Some(a) = exceedance(bucket, &entry, &by_index, thresholds) {
            anomalies.push(a);
          }
        }
      }
    }

    if let Some(sig) = key.signature() {
      if key.service != WILDCARD && !baseline.knows_signature(&key.service, sig) {
        for bucket in &buckets {
          if bucket.count > 0 && flagged_signatures.insert((bucket.window, key.service.as_str(), sig)) {
            anomalies.push(new_signature(bucket, &by_index, thresholds));
          }
        }
      }
    }
  }

  anomalies.sort_by(rank);
  anomalies
}

/// Ranking order: deviation desc, confidence desc, dimension key asc, then window,
/// kind and id so that equal scores still sort deterministically.
pub fn rank(a: &Anomaly, b: &Anomaly) -> Ordering {
  b.deviation_score
    .total_cmp(&a.deviation_score)
    .then_with(|| b.confidence.cmp(&a.confidence))
    .then_with(|| a.dimension_key.cmp(&b.dimension_key))
    .then_with(|| a.window.start.cmp(&b.window.start))
    .then_with(|| a.kind.cmp(&b.kind))
    .then_with(|| a.id.cmp(&b.id))
}

fn observed(bucket: &MetricBucket, metric: BaselineMetric) -> f64 {
  match metric {
    BaselineMetric::Count => bucket.count as f64,
    BaselineMetric::Rate => bucket.rate,
    BaselineMetric::Share => bucket.share,
  }
}

fn exceedance(
  bucket: &MetricBucket,
  entry: &BaselineEntry,
  by_index: &HashMap<usize, &ParsedEvent>,
  thresholds: &Thresholds,
) -> Option<Anomaly> {
  let observed = observed(bucket, entry.metric);
  let deviation = (observed - entry.expected) / entry.variability.max(thresholds.epsilon);

  let confidence = if deviation >= thresholds.high {
    Confidence::High
  } else if deviation >= thresholds.medium {
    Confidence::Medium
  } else {
    return None;
  };
  let kind = if entry.metric.is_rate() {
    AnomalyKind::RateIncrease
  } else {
    AnomalyKind::Spike
  };

  Some(Anomaly {
    id: fingerprint::anomaly_id(kind, &bucket.key, &bucket.window),
    dimension_key: bucket.key.clone(),
    kind,
    observed_value: observed,
    expected_value: entry.expected,
    deviation_score: deviation,
    confidence,
    evidence: evidence(&bucket.members, by_index, thresholds.evidence_cap),
    window: bucket.window,
  })
}

/// One record per key, placed in the latest window the key was seen in.
fn missing_baseline(
  key: &DimensionKey,
  buckets: &[&MetricBucket],
  by_index: &HashMap<usize, &ParsedEvent>,
  thresholds: &Thresholds,
) -> Option<Anomaly> {
  let latest = buckets.last()?;
  let count: u64 = buckets.iter().map(|b| b.count).sum();
  if count == 0 {
    return None;
  }
  let members: Vec<usize> = buckets.iter().flat_map(|b| b.members.iter().copied()).collect();
  let kind = AnomalyKind::MissingBaseline;

  Some(Anomaly {
    id: fingerprint::anomaly_id(kind, key, &latest.window),
    dimension_key: key.clone(),
    kind,
    observed_value: count as f64,
    expected_value: 0.0,
    deviation_score: 0.0,
    confidence: Confidence::Low,
    evidence: evidence(&members, by_index, thresholds.evidence_cap),
    window: latest.window,
  })
}

/// A signature never seen for this service. Scored at the HIGH threshold so it
/// ranks with the strongest count exceedances regardless of volume.
fn new_signature(bucket: &MetricBucket, by_index: &HashMap<usize, &ParsedEvent>, thresholds: &Thresholds) -> Anomaly {
  let kind = AnomalyKind::NewSignature;
  Anomaly {
    id: fingerprint::anomaly_id(kind, &bucket.key, &bucket.window),
    dimension_key: bucket.key.clone(),
    kind,
    observed_value: bucket.count as f64,
    expected_value: 0.0,
    deviation_score: thresholds.high,
    confidence: Confidence::High,
    evidence: evidence(&bucket.members, by_index, thresholds.evidence_cap),
    window: bucket.window,
  }
}

/// Up to `cap` member events, most recent first.
fn evidence(members: &[usize], by_index: &HashMap<usize, &ParsedEvent>, cap: usize) -> Vec<ParsedEvent> {
  let mut picked: Vec<&ParsedEvent> = members.iter().filter_map(|i| by_index.get(i).copied()).collect();
  picked.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.index.cmp(&a.index)));
  picked.dedup_by_key(|e| e.index);
  picked.into_iter().take(cap).cloned().collect()
}
