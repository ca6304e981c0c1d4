//! Log analysis engine: deterministic, rule-based.
//!
//! Parses raw log lines into events, aggregates them into windowed metric
//! series, compares each series against a caller-supplied baseline, and groups
//! co-temporal anomalies into correlation-only hypotheses.
//!
//! No network, no storage; the baseline is read through a trait.

pub mod aggregate;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod error;
pub mod fingerprint;
pub mod hypothesis;
pub mod parse;
pub mod pipeline;
pub mod recommend;
pub mod rules;
pub mod summary;
pub mod types;

pub use baseline::{BaselineEntry, BaselineLookup, BaselineMetric, InMemoryBaseline};
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{run, Pipeline, RunControl};
pub use types::{Anomaly, Hypothesis, LogLine, ParsedEvent, Report, Status};
