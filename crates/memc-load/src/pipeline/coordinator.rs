//! Run coordinator
//!
//! Drives one run through its states:
//! 1. Discovering: list source files; none is a successful no-op
//! 2. Dispatching: start the aggregator, the worker pool and one ingestion
//!    stage per file
//! 3. Draining: wait for every stage, close the job queue, wait for every
//!    worker, close the outcome queue
//! 4. Aggregating: collect the final tally
//! 5. Gating: judge the error rate; on success mark fully read files
//!
//! A fatal rejection from any endpoint ends the run as `Failed` and is
//! returned as [`LoadError::FatalServer`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::aggregator::{aggregate, RunStats};
use super::gate::{error_rate, RunVerdict};
use super::ingest::{ingest_file, StageContext, StageReport};
use super::worker::WorkerPool;
use crate::config::LoadConfig;
use crate::endpoints::EndpointTable;
use crate::error::{LoadError, Result};
use crate::source::{discover, dot_rename};
use crate::writer::CacheWriter;

/// Where a run is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Discovering,
    Dispatching,
    Draining,
    Aggregating,
    Gating,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Discovering => "discovering",
            RunState::Dispatching => "dispatching",
            RunState::Draining => "draining",
            RunState::Aggregating => "aggregating",
            RunState::Gating => "gating",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub verdict: RunVerdict,
    pub stats: RunStats,
    pub files: Vec<StageReport>,
    /// New paths of files marked as processed
    pub renamed: Vec<PathBuf>,
}

impl RunReport {
    fn nothing_to_do(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Done,
            verdict: RunVerdict::NothingToDo,
            stats: RunStats::default(),
            files: Vec::new(),
            renamed: Vec::new(),
        }
    }
}

/// Runs the pipeline for one configuration
pub struct RunCoordinator {
    config: Arc<LoadConfig>,
    table: Arc<EndpointTable>,
    writer: CacheWriter,
}

impl RunCoordinator {
    pub fn new(config: Arc<LoadConfig>, table: Arc<EndpointTable>, writer: CacheWriter) -> Self {
        Self {
            config,
            table,
            writer,
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Discover files from the configured pattern, then process them.
    pub async fn run(&self) -> Result<RunReport> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.discover_and_process(run_id).instrument(span).await
    }

    /// Process an explicit list of files, skipping discovery.
    pub async fn run_files(&self, files: Vec<PathBuf>) -> Result<RunReport> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        if files.is_empty() {
            return Ok(RunReport::nothing_to_do(run_id));
        }

        let span = tracing::info_span!("run", %run_id);
        self.process(run_id, files).instrument(span).await
    }

    async fn discover_and_process(&self, run_id: Uuid) -> Result<RunReport> {
        debug!(state = RunState::Discovering.as_str(), pattern = %self.config.pattern, "Run state");

        let pattern = self.config.pattern.clone();
        let files = tokio::task::spawn_blocking(move || discover(&pattern)).await??;
        if files.is_empty() {
            info!("No files match {}, nothing to do", self.config.pattern);
            return Ok(RunReport::nothing_to_do(run_id));
        }

        self.process(run_id, files).await
    }

    async fn process(&self, run_id: Uuid, files: Vec<PathBuf>) -> Result<RunReport> {
        let config = &self.config;
        let mut state = self.advance(RunState::Discovering, RunState::Dispatching);
        info!(
            files = files.len(),
            workers = config.workers,
            dry_run = config.dry_run,
            "Dispatching"
        );

        let cancel = CancellationToken::new();
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.queue_capacity);

        let aggregator = tokio::spawn(aggregate(outcome_rx).in_current_span());
        let pool = WorkerPool::spawn(
            config.workers,
            job_rx,
            outcome_tx.clone(),
            self.writer.clone(),
            cancel.clone(),
        );

        let mut stages = JoinSet::new();
        for path in files {
            let ctx = StageContext {
                table: self.table.clone(),
                dry_run: config.dry_run,
                jobs: job_tx.clone(),
                outcomes: outcome_tx.clone(),
                cancel: cancel.clone(),
            };
            let span = tracing::Span::current();
            stages.spawn_blocking(move || span.in_scope(|| ingest_file(&path, &ctx)));
        }

        state = self.advance(state, RunState::Draining);
        let mut reports = Vec::new();
        let mut stage_failure = None;
        while let Some(joined) = stages.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Ingestion stage failed: {}", e);
                    cancel.cancel();
                    stage_failure.get_or_insert(LoadError::from(e));
                },
            }
        }
        drop(job_tx);

        let handled = pool.join().await?;
        drop(outcome_tx);
        debug!(handled, "All workers finished");

        state = self.advance(state, RunState::Aggregating);
        let summary = aggregator.await?;
        let stats = summary.stats;

        if let Some(err) = stage_failure {
            self.advance(state, RunState::Failed);
            return Err(err);
        }

        if let Some(fatal) = summary.fatal {
            self.advance(state, RunState::Failed);
            error!(
                processed = stats.processed,
                errors = stats.errors,
                "Run aborted by {}: {}",
                fatal.address,
                fatal.message
            );
            return Err(LoadError::FatalServer {
                address: fatal.address,
                message: fatal.message,
                processed: stats.processed,
                errors: stats.errors,
            });
        }

        state = self.advance(state, RunState::Gating);
        let verdict = RunVerdict::judge(&stats, config.error_rate_threshold);
        let mut renamed = Vec::new();

        if verdict.is_success() {
            info!(
                processed = stats.processed,
                errors = stats.errors,
                "Acceptable error rate ({:.4}). Successful load",
                error_rate(&stats)
            );
            if config.rename_on_success {
                renamed = mark_processed(&reports);
            }
            state = self.advance(state, RunState::Done);
        } else {
            error!(
                processed = stats.processed,
                errors = stats.errors,
                "High error rate ({:.4} >= {:.4}). Failed load",
                error_rate(&stats),
                config.error_rate_threshold
            );
            state = self.advance(state, RunState::Failed);
        }

        Ok(RunReport {
            run_id,
            state,
            verdict,
            stats,
            files: reports,
            renamed,
        })
    }

    fn advance(&self, from: RunState, to: RunState) -> RunState {
        debug!(from = from.as_str(), to = to.as_str(), "Run state");
        to
    }
}

/// Dot-rename every fully read file; failures are logged and skipped.
fn mark_processed(reports: &[StageReport]) -> Vec<PathBuf> {
    let mut renamed = Vec::new();
    for report in reports {
        if !report.complete {
            warn!("{} was not read to the end, leaving it in place", report.path.display());
            continue;
        }
        match dot_rename(&report.path) {
            Ok(target) => {
                debug!("Renamed {} to {}", report.path.display(), target.display());
                renamed.push(target);
            },
            Err(e) => error!("Cannot rename {}: {}", report.path.display(), e),
        }
    }
    renamed
}
