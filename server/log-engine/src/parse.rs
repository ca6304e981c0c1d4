//! Event parser: raw log lines -> canonical ParsedEvents.
//!
//! Total over its input: every line yields exactly one event, in input order.
//! Lines no rule matches come out with severity UNKNOWN and no pattern id.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::config::MAX_WORKERS;
use crate::error::PipelineError;
use crate::rules::Ruleset;
use crate::types::{LogLine, ParsedEvent, Severity};

/// Service name used when neither the line nor its source names one.
pub const UNKNOWN_SERVICE: &str = "unknown";

const ZONED_FORMATS: [&str; 3] = [
  "%Y-%m-%dT%H:%M:%S%.f%z",
  "%Y-%m-%d %H:%M:%S%.f%z",
  "%d/%b/%Y:%H:%M:%S %z",
];

const NAIVE_FORMATS: [&str; 4] = [
  "%Y-%m-%dT%H:%M:%S%.fZ",
  "%Y-%m-%d %H:%M:%S%.fZ",
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S%.f",
];

/// Parser output: one event per input line plus the recoverable issues met on the way.
#[derive(Debug, Default)]
pub struct ParseOutput {
  pub events: Vec<ParsedEvent>,
  pub issues: Vec<PipelineError>,
}

/// Parse all lines sequentially.
pub fn parse(lines: &[LogLine], rules: &Ruleset) -> ParseOutput {
  parse_chunk(lines, 0, rules)
}

/// Parse on up to `workers` scoped threads. Chunks are contiguous and concatenated
/// in order, so the output equals `parse` on the same input.
pub fn parse_parallel(lines: &[LogLine], rules: &Ruleset, workers: usize) -> Result<ParseOutput, PipelineError> {
  let workers = workers.min(MAX_WORKERS);
  if workers <= 1 || lines.len() / 2 < workers {
    return Ok(parse(lines, rules));
  }
  let chunk = lines.len().div_ceil(workers);

  std::thread::scope(|scope| {
    let handles: Vec<_> = lines
      .chunks(chunk)
      .enumerate()
      .map(|(i, part)| scope.spawn(move || parse_chunk(part, i * chunk, rules)))
      .collect();

    let mut out = ParseOutput {
      events: Vec::with_capacity(lines.len()),
      issues: Vec::new(),
    };
    for handle in handles {
      let part = handle
        .join()
        .map_err(|_| PipelineError::Worker("parse worker panicked".into()))?;
      out.events.extend(part.events);
      out.issues.extend(part.issues);
    }
    Ok(out)
  })
}

fn parse_chunk(lines: &[LogLine], offset: usize, rules: &Ruleset) -> ParseOutput {
  let mut out = ParseOutput {
    events: Vec::with_capacity(lines.len()),
    issues: Vec::new(),
  };
  for (i, line) in lines.iter().enumerate() {
    let event = parse_line(offset + i, line, rules, &mut out.issues);
    out.events.push(event);
  }
  out
}

/// Parse one line. Never fails; problems are pushed onto `issues`.
pub fn parse_line(index: usize, line: &LogLine, rules: &Ruleset, issues: &mut Vec<PipelineError>) -> ParsedEvent {
  let text = line.text.trim_end_matches(['\r', '\n']);
  let fallback_service = if line.source.trim().is_empty() {
    UNKNOWN_SERVICE.to_string()
  } else {
    line.source.trim().to_string()
  };

  let matched = rules
    .rules()
    .iter()
    .find_map(|rule| rule.extract(text).map(|x| (rule, x)));

  let Some((rule, x)) = matched else {
    issues.push(PipelineError::parse(index, "no pattern rule matched"));
    let message = text.trim().to_string();
    return ParsedEvent {
      index,
      source: line.source.clone(),
      timestamp: line.ingested_at,
      timestamp_inferred: true,
      service: fallback_service,
      severity: Severity::Unknown,
      attributes: rules.attributes(&message),
      message,
      error_signature: None,
      raw: line.text.clone(),
      source_pattern_id: None,
    };
  };

  let parsed_ts = x
    .timestamp
    .and_then(|t| parse_timestamp(t, rule.timestamp_format()));
  match (x.timestamp, parsed_ts) {
    (Some(t), None) => issues.push(PipelineError::parse(
      index,
      format!("unparseable timestamp `{}` (rule {}); using ingestion time", t, rule.id()),
    )),
    (None, None) => issues.push(PipelineError::parse(
      index,
      format!("no timestamp (rule {}); using ingestion time", rule.id()),
    )),
    _ => {}
  }
  let (timestamp, timestamp_inferred) = match parsed_ts {
    Some(ts) => (ts, false),
    None => (line.ingested_at, true),
  };

  let severity = match x.severity {
    Some(token) => Severity::from_str_loose(token).unwrap_or_else(|| {
      issues.push(PipelineError::parse(
        index,
        format!("unrecognised severity `{}` (rule {})", token, rule.id()),
      ));
      Severity::Unknown
    }),
    None => Severity::Unknown,
  };

  let message = x.message.unwrap_or_else(|| text.trim()).to_string();
  let error_signature = match x.signature {
    Some(sig) => Some(sig.to_ascii_uppercase()),
    None if severity.is_error() => Some(rules.classify(&message)),
    None => None,
  };

  ParsedEvent {
    index,
    source: line.source.clone(),
    timestamp,
    timestamp_inferred,
    service: x.service.map(str::to_string).unwrap_or(fallback_service),
    severity,
    attributes: rules.attributes(&message),
    message,
    error_signature,
    raw: line.text.clone(),
    source_pattern_id: Some(rule.id().to_string()),
  }
}

/// Parse a timestamp with the rule's own format first, then the generic formats.
/// Zone-less times are taken as UTC.
pub fn parse_timestamp(s: &str, rule_format: Option<&str>) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Some(fmt) = rule_format {
    if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
      return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
      return Some(Utc.from_utc_datetime(&naive));
    }
  }
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  for fmt in ZONED_FORMATS {
    if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
      return Some(dt.with_timezone(&Utc));
    }
  }
  for fmt in NAIVE_FORMATS {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
      return Some(Utc.from_utc_datetime(&naive));
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::PatternSpec;
  use crate::rules::{builtin_patterns, builtin_signatures};

  fn ingest() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
  }

  fn line(text: &str) -> LogLine {
    LogLine::new("auth-service", text, ingest())
  }

  fn rules() -> Ruleset {
    Ruleset::compile(&builtin_patterns(), &builtin_signatures()).unwrap()
  }

  #[test]
  fn parse_timestamp_formats() {
    let want = Utc.with_ymd_and_hms(2025, 1, 15, 10, 5, 0).unwrap();
    assert_eq!(parse_timestamp("2025-01-15T10:05:00Z", None), Some(want));
    assert_eq!(parse_timestamp("2025-01-15T12:05:00+02:00", None), Some(want));
    assert_eq!(parse_timestamp("2025-01-15 10:05:00", None), Some(want));
    assert_eq!(parse_timestamp("2025-01-15T10:05:00.000", None), Some(want));
    assert_eq!(parse_timestamp("15/Jan/2025:10:05:00 +0000", None), Some(want));
    assert_eq!(parse_timestamp("Jan 15 10:05:00", None), None);
    assert_eq!(parse_timestamp("15.01.2025 10:05", Some("%d.%m.%Y %H:%M")), Some(want));
  }

  #[test]
  fn structured_error_line() {
    let mut issues = Vec::new();
    let ev = parse_line(
      0,
      &line("2025-01-15T10:05:00Z ERROR [payments] Database timeout after 5000ms"),
      &rules(),
      &mut issues,
    );
    assert!(issues.is_empty());
    assert_eq!(ev.severity, Severity::Error);
    assert_eq!(ev.service, "payments");
    assert_eq!(ev.error_signature.as_deref(), Some("DB_TIMEOUT"));
    assert_eq!(ev.source_pattern_id.as_deref(), Some("iso_level"));
    assert!(!ev.timestamp_inferred);
    assert_eq!(ev.attributes["latency_ms"], "5000");
  }

  #[test]
  fn service_falls_back_to_source() {
    let mut issues = Vec::new();
    let ev = parse_line(0, &line("2025-01-15T10:05:00Z INFO login ok"), &rules(), &mut issues);
    assert_eq!(ev.service, "auth-service");
    assert_eq!(ev.severity, Severity::Info);
    assert_eq!(ev.error_signature, None);

    let anon = LogLine::new("  ", "INFO: started", ingest());
    let ev = parse_line(1, &anon, &rules(), &mut issues);
    assert_eq!(ev.service, UNKNOWN_SERVICE);
  }

  #[test]
  fn rule_without_timestamp_infers_with_issue() {
    let mut issues = Vec::new();
    let ev = parse_line(0, &line("WARN: disk at 91%"), &rules(), &mut issues);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].to_string().contains("no timestamp (rule level_prefix)"));
    assert!(ev.timestamp_inferred);
    assert_eq!(ev.timestamp, ingest());
    assert_eq!(ev.severity, Severity::Warn);
    assert_eq!(ev.source_pattern_id.as_deref(), Some("level_prefix"));
  }

  #[test]
  fn bad_timestamp_falls_back_with_issue() {
    let mut issues = Vec::new();
    let ev = parse_line(4, &line("[yesterday-ish] ERROR upstream timed out"), &rules(), &mut issues);
    assert!(ev.timestamp_inferred);
    assert_eq!(ev.timestamp, ingest());
    assert_eq!(ev.error_signature.as_deref(), Some("TIMEOUT"));
    assert_eq!(issues.len(), 1);
    assert!(issues[0].to_string().contains("line 4"));
  }

  #[test]
  fn unmatched_line_is_kept() {
    let mut issues = Vec::new();
    let ev = parse_line(2, &line("   free text nobody expected"), &rules(), &mut issues);
    assert_eq!(ev.severity, Severity::Unknown);
    assert_eq!(ev.error_signature, None);
    assert_eq!(ev.source_pattern_id, None);
    assert_eq!(ev.message, "free text nobody expected");
    assert_eq!(ev.raw, "   free text nobody expected");
    assert!(ev.timestamp_inferred);
    assert_eq!(issues.len(), 1);
  }

  #[test]
  fn first_matching_rule_wins() {
    let specs = vec![
      PatternSpec {
        id: "catch_all".into(),
        regex: r"^(?P<message>.*)$".into(),
        fields: Default::default(),
        timestamp_format: None,
      },
      builtin_patterns().remove(0),
    ];
    let rules = Ruleset::compile(&specs, &[]).unwrap();
    let mut issues = Vec::new();
    let ev = parse_line(0, &line("2025-01-15T10:05:00Z ERROR boom"), &rules, &mut issues);
    assert_eq!(ev.source_pattern_id.as_deref(), Some("catch_all"));
    assert_eq!(ev.severity, Severity::Unknown);
  }

  #[test]
  fn unrecognised_severity_token() {
    let specs = vec![PatternSpec {
      id: "kv".into(),
      regex: r"^lvl=(?P<severity>\w+) (?P<message>.*)$".into(),
      fields: Default::default(),
      timestamp_format: None,
    }];
    let rules = Ruleset::compile(&specs, &[]).unwrap();
    let mut issues = Vec::new();
    let ev = parse_line(0, &line("lvl=verbose hello"), &rules, &mut issues);
    assert_eq!(ev.severity, Severity::Unknown);
    assert_eq!(ev.source_pattern_id.as_deref(), Some("kv"));
    assert!(issues.iter().any(|e| e.to_string().contains("verbose")));
  }

  #[test]
  fn empty_input_gives_empty_output() {
    let out = parse(&[], &rules());
    assert!(out.events.is_empty());
    assert!(out.issues.is_empty());
  }

  #[test]
  fn parallel_matches_sequential() {
    let lines: Vec<LogLine> = (0..37)
      .map(|i| match i % 3 {
        0 => line(&format!("2025-01-15T10:{:02}:00Z ERROR [api] request {} timed out", i, i)),
        1 => line(&format!("INFO: tick {}", i)),
        _ => line(&format!("garbage {}", i)),
      })
      .collect();
    let rules = rules();
    let seq = parse(&lines, &rules);
    let par = parse_parallel(&lines, &rules, 4).unwrap();
    assert_eq!(seq.events, par.events);
    let seq_issues: Vec<String> = seq.issues.iter().map(|e| e.to_string()).collect();
    let par_issues: Vec<String> = par.issues.iter().map(|e| e.to_string()).collect();
    assert_eq!(seq_issues, par_issues);
    assert!(par.events.iter().enumerate().all(|(i, e)| e.index == i));
  }

  #[test]
  fn blank_line_is_an_unknown_event() {
    let mut issues = Vec::new();
    let ev = parse_line(7, &line(""), &rules(), &mut issues);
    assert_eq!(ev.index, 7);
    assert_eq!(ev.severity, Severity::Unknown);
    assert!(ev.timestamp_inferred);
    assert_eq!(issues.len(), 1);
  }

  #[test]
  fn huge_worker_count_parses_sequentially() {
    let lines: Vec<LogLine> = (0..5).map(|i| line(&format!("INFO: tick {}", i))).collect();
    let out = parse_parallel(&lines, &rules(), usize::MAX).unwrap();
    assert_eq!(out.events.len(), 5);
  }
}
