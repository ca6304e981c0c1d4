//! Aggregator: epoch-aligned windowing and per-dimension counting.
//!
//! Windows are `[k * size, (k + 1) * size)` in Unix seconds, so buckets from
//! different runs line up. Only windows holding at least one event are emitted.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::{DimensionSpec, MAX_WORKERS};
use crate::error::PipelineError;
use crate::types::{DimensionKey, MetricBucket, ParsedEvent, Window, WILDCARD};

/// (window index, dimension key) -> member event indices.
type Partial = BTreeMap<(i64, DimensionKey), Vec<usize>>;

fn window_secs(window: Duration) -> i64 {
  window.as_secs().max(1) as i64
}

/// Index of the window containing `ts`. Euclidean division keeps pre-epoch times aligned.
pub fn window_index(ts: DateTime<Utc>, window: Duration) -> i64 {
  ts.timestamp().div_euclid(window_secs(window))
}

/// The window containing `ts`.
pub fn window_for(ts: DateTime<Utc>, window: Duration) -> Window {
  window_bounds(window_index(ts, window), window_secs(window))
}

fn window_bounds(index: i64, secs: i64) -> Window {
  let start = Utc
    .timestamp_opt(index.saturating_mul(secs), 0)
    .single()
    .unwrap_or(DateTime::<Utc>::MIN_UTC);
  let end = start
    .checked_add_signed(ChronoDuration::seconds(secs))
    .unwrap_or(DateTime::<Utc>::MAX_UTC);
  Window { start, end }
}

/// Dimension keys an event counts toward, the synthetic total included.
pub fn keys_for(event: &ParsedEvent, dims: &BTreeSet<DimensionSpec>) -> Vec<DimensionKey> {
  let service = event.service.as_str();
  let severity = event.severity.as_str();
  let signature = event.error_signature.as_deref();

  let mut keys = Vec::with_capacity(dims.len() + 1);
  keys.push(DimensionKey::total());
  for dim in dims {
    match (dim, signature) {
      (DimensionSpec::Service, _) => keys.push(DimensionKey::new(service, WILDCARD, WILDCARD)),
      (DimensionSpec::ServiceSeverity, _) => keys.push(DimensionKey::new(service, severity, WILDCARD)),
      (DimensionSpec::ServiceSignature, Some(sig)) => keys.push(DimensionKey::new(service, WILDCARD, sig)),
      (DimensionSpec::ServiceSeveritySignature, Some(sig)) => {
        keys.push(DimensionKey::new(service, severity, sig))
      }
      (DimensionSpec::ServiceSignature | DimensionSpec::ServiceSeveritySignature, None) => {}
    }
  }
  keys
}

fn accumulate(events: &[ParsedEvent], window: Duration, dims: &BTreeSet<DimensionSpec>) -> Partial {
  let mut partial = Partial::new();
  for event in events {
    let idx = window_index(event.timestamp, window);
    for key in keys_for(event, dims) {
      partial.entry((idx, key)).or_default().push(event.index);
    }
  }
  partial
}

fn finish(partial: Partial, window: Duration) -> Vec<MetricBucket> {
  let secs = window_secs(window);
  let totals: BTreeMap<i64, u64> = partial
    .iter()
    .filter(|((_, key), _)| key.is_total())
    .map(|((idx, _), members)| (*idx, members.len() as u64))
    .collect();

  partial
    .into_iter()
    .map(|((idx, key), mut members)| {
      members.sort_unstable();
      let count = members.len() as u64;
      let total = totals.get(&idx).copied().unwrap_or(count).max(1);
      MetricBucket {
        window: window_bounds(idx, secs),
        key,
        count,
        rate: count as f64 / secs as f64,
        share: count as f64 / total as f64,
        members,
      }
    })
    .collect()
}

/// Count events per window and dimension. Output is sorted by (window, key) and
/// does not depend on the order of `events`.
pub fn aggregate(events: &[ParsedEvent], window: Duration, dims: &BTreeSet<DimensionSpec>) -> Vec<MetricBucket> {
  finish(accumulate(events, window, dims), window)
}

/// `aggregate` split over up to `workers` scoped threads; partial maps are merged
/// before finishing, so the result equals the sequential one.
pub fn aggregate_parallel(
  events: &[ParsedEvent],
  window: Duration,
  dims: &BTreeSet<DimensionSpec>,
  workers: usize,
) -> Result<Vec<MetricBucket>, PipelineError> {
  let workers = workers.min(MAX_WORKERS);
  if workers <= 1 || events.len() / 2 < workers {
    return Ok(aggregate(events, window, dims));
  }
  let chunk = events.len().div_ceil(workers);

  let merged = std::thread::scope(|scope| {
    let handles: Vec<_> = events
      .chunks(chunk)
      .map(|part| scope.spawn(move || accumulate(part, window, dims)))
      .collect();

    let mut merged = Partial::new();
    for handle in handles {
      let part = handle
        .join()
        .map_err(|_| PipelineError::Worker("aggregate worker panicked".into()))?;
      for (k, members) in part {
        merged.entry(k).or_default().extend(members);
      }
    }
    Ok::<_, PipelineError>(merged)
  })?;

  Ok(finish(merged, window))
}
