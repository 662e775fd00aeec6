//! Result aggregator: the single consumer of the outcome queue

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{FatalSignal, Outcome};

/// Final tally of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub processed: u64,
    pub errors: u64,
}

impl RunStats {
    pub fn total(&self) -> u64 {
        self.processed + self.errors
    }
}

/// Everything the aggregator saw once the outcome queue closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub stats: RunStats,
    /// First fatal rejection, if any. Not counted in `stats`.
    pub fatal: Option<FatalSignal>,
}

/// Drain `outcomes` until every sender is gone.
pub async fn aggregate(mut outcomes: mpsc::Receiver<Outcome>) -> AggregateSummary {
    let mut summary = AggregateSummary::default();

    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            Outcome::Success => summary.stats.processed += 1,
            Outcome::Failure(_) => summary.stats.errors += 1,
            Outcome::Fatal(signal) => {
                if summary.fatal.is_none() {
                    summary.fatal = Some(signal);
                } else {
                    error!(address = %signal.address, "Further rejection after abort: {}", signal.message);
                }
            },
        }
    }

    debug!(
        processed = summary.stats.processed,
        errors = summary.stats.errors,
        fatal = summary.fatal.is_some(),
        "Outcome queue drained"
    );
    summary
}
