//! Orchestrator: sequences PARSE -> AGGREGATE -> DETECT -> HYPOTHESIZE.
//!
//! Each stage consumes the previous stage's artifact and produces a new one.
//! Recoverable problems become report warnings; fatal ones end the run with a
//! FAILED report. The deadline/cancel signal is honoured between stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::aggregate;
use crate::baseline::BaselineLookup;
use crate::config::Config;
use crate::detect;
use crate::error::PipelineError;
use crate::hypothesis;
use crate::parse;
use crate::rules::Ruleset;
use crate::types::*;

/// Per-line parse warnings copied into a report before the rest are summarised.
pub const MAX_LINE_WARNINGS: usize = 20;

/// External stop signal: an optional deadline and an optional cancel flag.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
  deadline: Option<Instant>,
  cancel: Option<Arc<AtomicBool>>,
}

impl RunControl {
  pub fn new() -> Self {
    Self::default()
  }

  /// Stop at `at`, or at the existing deadline if that is earlier.
  pub fn with_deadline(mut self, at: Instant) -> Self {
    self.deadline = Some(match self.deadline {
      Some(existing) => existing.min(at),
      None => at,
    });
    self
  }

  pub fn with_timeout(self, budget: Duration) -> Self {
    match Instant::now().checked_add(budget) {
      Some(at) => self.with_deadline(at),
      None => self,
    }
  }

  pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
    self.cancel = Some(flag);
    self
  }

  pub fn should_stop(&self) -> bool {
    let cancelled = self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Relaxed));
    let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
    cancelled || expired
  }

  fn checkpoint(&self, stage: Stage) -> Result<(), PipelineError> {
    if self.should_stop() {
      Err(PipelineError::DeadlineExceeded { stage })
    } else {
      Ok(())
    }
  }
}

/// Stage outputs accumulated over one run.
#[derive(Default)]
struct Artifacts {
  events: Vec<ParsedEvent>,
  metrics: Vec<MetricBucket>,
  anomalies: Vec<Anomaly>,
  hypotheses: Vec<Hypothesis>,
  warnings: Vec<String>,
}

impl Artifacts {
  fn into_report(mut self, status: Status, max_events: Option<usize>) -> Report {
    if let Some(cap) = max_events {
      if self.events.len() > cap {
        self
          .warnings
          .push(format!("report events truncated to {} of {}", cap, self.events.len()));
        self.events.truncate(cap);
      }
    }
    let status = match status {
      Status::Ok if !self.warnings.is_empty() => Status::Partial,
      other => other,
    };
    Report {
      status,
      events: self.events,
      metrics: self.metrics,
      anomalies: self.anomalies,
      hypotheses: self.hypotheses,
      warnings: self.warnings,
      failure: None,
    }
  }

  fn timed_out(mut self, err: PipelineError, max_events: Option<usize>) -> Report {
    warn!(error = %err, "stopping run early");
    self.warnings.push(format!("{}; remaining stages skipped", err));
    self.into_report(Status::Timeout, max_events)
  }
}

/// The analysis pipeline with its compiled rule table. Holds no per-run state.
pub struct Pipeline {
  config: Config,
  rules: Ruleset,
}

impl Pipeline {
  /// Validate the config and compile the rule table. Fails on the first bad rule.
  pub fn new(config: Config) -> Result<Self, PipelineError> {
    config.validate()?;
    let rules = Ruleset::compile(&config.patterns, &config.signatures)?;
    Ok(Self { config, rules })
  }

  pub fn with_defaults() -> Result<Self, PipelineError> {
    Self::new(Config::default())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Run all core stages over `lines`. Never panics on data; every outcome is a Report.
  pub fn run(&self, lines: &[LogLine], baseline: &dyn BaselineLookup, control: &RunControl) -> Report {
    let control = match self.config.deadline {
      Some(budget) => control.clone().with_timeout(budget),
      None => control.clone(),
    };
    let max_events = self.config.max_report_events;
    let mut out = Artifacts::default();

    // PARSE
    if let Err(e) = control.checkpoint(Stage::Parse) {
      return out.timed_out(e, max_events);
    }
    let parsed = match parse::parse_parallel(lines, &self.rules, self.config.workers) {
      Ok(p) => p,
      Err(e) => return fatal(Stage::Parse, e, out.warnings),
    };
    record_issues(&mut out.warnings, &parsed.issues);
    out.events = parsed.events;
    out.events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.index.cmp(&b.index)));
    debug!(lines = lines.len(), issues = parsed.issues.len(), "parse complete");

    // AGGREGATE
    if let Err(e) = control.checkpoint(Stage::Aggregate) {
      return out.timed_out(e, max_events);
    }
    out.metrics = match aggregate::aggregate_parallel(
      &out.events,
      self.config.window,
      &self.config.dimensions,
      self.config.workers,
    ) {
      Ok(m) => m,
      Err(e) => return fatal(Stage::Aggregate, e, out.warnings),
    };
    debug!(buckets = out.metrics.len(), "aggregate complete");

    // DETECT
    if let Err(e) = control.checkpoint(Stage::Detect) {
      return out.timed_out(e, max_events);
    }
    out.anomalies = detect::detect(&out.metrics, &out.events, baseline, &self.config.thresholds);
    let missing = out
      .anomalies
      .iter()
      .filter(|a| a.kind == AnomalyKind::MissingBaseline)
      .count();
    if missing > 0 {
      warn!(missing, "dimension keys without baseline");
    }
    debug!(anomalies = out.anomalies.len(), "detect complete");

    // HYPOTHESIZE
    if let Err(e) = control.checkpoint(Stage::Hypothesize) {
      return out.timed_out(e, max_events);
    }
    out.hypotheses = hypothesis::hypothesize(&out.anomalies, self.config.correlation_window);
    debug!(hypotheses = out.hypotheses.len(), "hypothesize complete");

    let report = out.into_report(Status::Ok, max_events);
    info!(
      status = ?report.status,
      events = report.events.len(),
      anomalies = report.anomalies.len(),
      hypotheses = report.hypotheses.len(),
      warnings = report.warnings.len(),
      "pipeline run complete"
    );
    report
  }
}

/// Build the pipeline from `config` and run it. A config error yields a FAILED
/// report naming the offending rule instead of an `Err`.
pub fn run(config: Config, lines: &[LogLine], baseline: &dyn BaselineLookup, control: &RunControl) -> Report {
  match Pipeline::new(config) {
    Ok(pipeline) => pipeline.run(lines, baseline, control),
    Err(e) => fatal(Stage::Parse, e, Vec::new()),
  }
}

fn fatal(stage: Stage, err: PipelineError, warnings: Vec<String>) -> Report {
  warn!(%stage, error = %err, "pipeline run failed");
  let mut report = Report::failed(stage, &err);
  report.warnings = warnings;
  report
}

fn record_issues(warnings: &mut Vec<String>, issues: &[PipelineError]) {
  warnings.extend(issues.iter().take(MAX_LINE_WARNINGS).map(|e| e.to_string()));
  if issues.len() > MAX_LINE_WARNINGS {
    warnings.push(format!(
      "{} more parse issues not listed ({} total)",
      issues.len() - MAX_LINE_WARNINGS,
      issues.len()
    ));
  }
}
