//! Binary entrypoint: read raw log lines from stdin, write one JSON document to stdout.
//!
//! Output is `{ report, summary, recommendations }`. Exit status is 0 for OK and
//! PARTIAL runs, 1 for FAILED and TIMEOUT.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use log_engine::recommend::{recommend, Recommendation};
use log_engine::summary::{summarize, RunSummary};
use log_engine::{Config, InMemoryBaseline, LogLine, Report, RunControl, Status};

#[derive(Parser, Debug)]
#[command(name = "log-engine", version, about = "Analyze log lines for anomalies")]
struct Cli {
  /// Pipeline config (TOML). Defaults apply when omitted.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Baseline file (JSON). Without one every series reports MISSING_BASELINE.
  #[arg(long)]
  baseline: Option<PathBuf>,

  /// Source id recorded on every input line.
  #[arg(long, default_value = "stdin")]
  source: String,

  #[arg(long)]
  pretty: bool,
}

#[derive(Serialize)]
struct Output<'a> {
  report: &'a Report,
  summary: RunSummary,
  recommendations: Vec<Recommendation>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let config = match &cli.config {
    Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
    None => Config::default(),
  };
  let baseline = match &cli.baseline {
    Some(path) => {
      let text = std::fs::read_to_string(path).with_context(|| format!("reading baseline {}", path.display()))?;
      InMemoryBaseline::from_json(&text).with_context(|| format!("loading baseline {}", path.display()))?
    }
    None => InMemoryBaseline::new(),
  };

  let ingested_at = Utc::now();
  let mut lines = Vec::new();
  for line in io::stdin().lock().lines() {
    // Blank lines are kept; they come back as UNKNOWN events with a warning.
    let text = line.context("reading stdin")?;
    lines.push(LogLine::new(cli.source.as_str(), text, ingested_at));
  }
  tracing::info!(lines = lines.len(), "read input");

  // Rule errors come back as a FAILED report naming the rule.
  let report = log_engine::run(config, &lines, &baseline, &RunControl::new());
  let output = Output {
    summary: summarize(&report),
    recommendations: recommend(&report.anomalies, &report.hypotheses),
    report: &report,
  };

  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());
  if cli.pretty {
    serde_json::to_writer_pretty(&mut out, &output)?;
  } else {
    serde_json::to_writer(&mut out, &output)?;
  }
  writeln!(out)?;
  out.flush()?;

  if matches!(report.status, Status::Failed | Status::Timeout) {
    std::process::exit(1);
  }
  Ok(())
}
