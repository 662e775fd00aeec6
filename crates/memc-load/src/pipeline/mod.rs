//! Concurrent load pipeline
//!
//! ```text
//! files ──▶ ingest (one blocking task per file) ──▶ job queue (bounded)
//!                │                                      │
//!                │ parse / routing failures             ▼
//!                │                               worker pool (W tasks)
//!                ▼                                      │
//!           outcome queue (bounded) ◀───────────────────┘
//!                │
//!                ▼
//!            aggregator ──▶ coordinator ──▶ error-rate gate
//! ```
//!
//! Every line read produces exactly one [`Outcome`]. A fatal server rejection
//! travels through the same outcome queue and cancels the run.

pub mod aggregator;
pub mod coordinator;
pub mod gate;
pub mod ingest;
pub mod worker;

use crate::endpoints::Endpoint;
use crate::error::ParseError;
use crate::record::AppsInstalled;

pub use aggregator::{AggregateSummary, RunStats};
pub use coordinator::{RunCoordinator, RunReport, RunState};
pub use gate::{error_rate, RunVerdict};
pub use ingest::{StageContext, StageReport};
pub use worker::WorkerPool;

/// One event routed to its endpoint, consumed by exactly one worker
#[derive(Debug, Clone)]
pub struct Job {
    pub record: AppsInstalled,
    pub endpoint: Endpoint,
    pub dry_run: bool,
}

/// Why a line or job did not end up in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The line did not parse
    Parse(ParseError),
    /// No endpoint configured for the device type
    UnknownDeviceType(String),
    /// Key would be refused by memcached
    InvalidKey(String),
    /// Endpoint stayed unreachable through the retry budget
    Unreachable { address: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Parse(e) => write!(f, "{}", e),
            FailureReason::UnknownDeviceType(t) => write!(f, "unknown device type '{}'", t),
            FailureReason::InvalidKey(k) => write!(f, "invalid cache key '{}'", k),
            FailureReason::Unreachable { address } => write!(f, "{} unreachable", address),
        }
    }
}

/// Explicit rejection from a cache endpoint; ends the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalSignal {
    pub address: String,
    pub message: String,
}

/// Result of one line (parse failure) or one job (write attempt)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureReason),
    Fatal(FatalSignal),
}
