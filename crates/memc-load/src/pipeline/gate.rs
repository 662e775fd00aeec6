//! Error-rate gate
//!
//! `error_rate = errors / (processed + errors)`, and `1.0` when nothing was
//! processed. Parse failures are errors like any other, so the rate is the
//! share of lines that did not reach the cache.

use serde::Serialize;

use super::RunStats;

pub fn error_rate(stats: &RunStats) -> f64 {
    if stats.processed == 0 {
        return 1.0;
    }
    stats.errors as f64 / stats.total() as f64
}

/// How a run ended, as far as the gate is concerned
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RunVerdict {
    /// No source files matched
    NothingToDo,
    Done { error_rate: f64 },
    Failed { error_rate: f64 },
}

impl RunVerdict {
    /// `rate >= threshold` fails the run
    pub fn judge(stats: &RunStats, threshold: f64) -> Self {
        let rate = error_rate(stats);
        if rate >= threshold {
            RunVerdict::Failed { error_rate: rate }
        } else {
            RunVerdict::Done { error_rate: rate }
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, RunVerdict::Failed { .. })
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunVerdict::NothingToDo => "nothing_to_do",
            RunVerdict::Done { .. } => "done",
            RunVerdict::Failed { .. } => "failed",
        }
    }
}
