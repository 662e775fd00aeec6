//! Ingestion stage: one source file in, jobs and failure outcomes out
//!
//! Runs on a blocking thread. Pushing onto a full job queue blocks the
//! stage, which is how a slow worker pool throttles reading.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{FailureReason, Job, Outcome};
use crate::endpoints::EndpointTable;
use crate::error::ParseError;
use crate::record::parse_line;
use crate::source::open_gzip;

/// Handles one stage needs; cheap to clone per file
#[derive(Debug, Clone)]
pub struct StageContext {
    pub table: Arc<EndpointTable>,
    pub dry_run: bool,
    pub jobs: mpsc::Sender<Job>,
    pub outcomes: mpsc::Sender<Outcome>,
    pub cancel: CancellationToken,
}

/// What one stage read and emitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub path: PathBuf,
    pub lines: u64,
    pub jobs: u64,
    pub failures: u64,
    /// Every line of the file was read and handed downstream
    pub complete: bool,
}

/// Why a stage stopped before the end of its input
enum Interrupted {
    Cancelled,
    QueueClosed,
}

/// Read a gzip file through [`ingest_reader`]. Blocking.
pub fn ingest_file(path: &Path, ctx: &StageContext) -> StageReport {
    let mut report = StageReport {
        path: path.to_path_buf(),
        ..StageReport::default()
    };

    info!("Processing {}", path.display());
    let reader = match open_gzip(path) {
        Ok(reader) => reader,
        Err(e) => {
            error!("Cannot open {}: {}", path.display(), e);
            return report;
        },
    };

    match ingest_reader(reader, ctx, &mut report) {
        Ok(()) => info!(
            lines = report.lines,
            jobs = report.jobs,
            failures = report.failures,
            "Finished reading {}",
            path.display()
        ),
        Err(e) => error!(
            lines = report.lines,
            "Stopped reading {} after {} lines: {}",
            path.display(),
            report.lines,
            e
        ),
    }
    report
}

/// Turn every line of `reader` into a job or a failure outcome.
///
/// `report.complete` is set only when the input was exhausted. A read error
/// is returned; cancellation and a closed queue end the stage quietly.
pub fn ingest_reader<R: BufRead>(
    reader: R,
    ctx: &StageContext,
    report: &mut StageReport,
) -> std::io::Result<()> {
    for chunk in reader.split(b'\n') {
        if ctx.cancel.is_cancelled() {
            debug!(path = %report.path.display(), "Run cancelled, stop reading");
            return Ok(());
        }

        let bytes = chunk?;
        report.lines += 1;

        if let Err(reason) = route_line(&bytes, ctx, report) {
            match reason {
                Interrupted::Cancelled => debug!("Run cancelled while queueing"),
                Interrupted::QueueClosed => debug!("Downstream queue closed, stop reading"),
            }
            return Ok(());
        }
    }

    report.complete = true;
    Ok(())
}

fn route_line(bytes: &[u8], ctx: &StageContext, report: &mut StageReport) -> Result<(), Interrupted> {
    let parsed = std::str::from_utf8(bytes)
        .map_err(|_| ParseError::InvalidUtf8)
        .and_then(|line| parse_line(line.trim()));

    let failure = match parsed {
        Ok(record) => match ctx.table.resolve(&record.dev_type) {
            Some(endpoint) => {
                let job = Job {
                    endpoint: endpoint.clone(),
                    record,
                    dry_run: ctx.dry_run,
                };
                ctx.jobs.blocking_send(job).map_err(|_| closed_or_cancelled(ctx))?;
                report.jobs += 1;
                return Ok(());
            },
            None => FailureReason::UnknownDeviceType(record.dev_type),
        },
        Err(e) => FailureReason::Parse(e),
    };

    debug!(line = report.lines, "Skipping line: {}", failure);
    ctx.outcomes
        .blocking_send(Outcome::Failure(failure))
        .map_err(|_| closed_or_cancelled(ctx))?;
    report.failures += 1;
    Ok(())
}

fn closed_or_cancelled(ctx: &StageContext) -> Interrupted {
    if ctx.cancel.is_cancelled() {
        Interrupted::Cancelled
    } else {
        Interrupted::QueueClosed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCache;
    use std::io::Cursor;

    fn context(capacity: usize) -> (StageContext, mpsc::Receiver<Job>, mpsc::Receiver<Outcome>) {
        let mut table = EndpointTable::new();
        table.insert("idfa", "127.0.0.1:33013", Arc::new(ScriptedCache::healthy()));
        table.insert("gaid", "127.0.0.1:33014", Arc::new(ScriptedCache::healthy()));

        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(capacity);
        let ctx = StageContext {
            table: Arc::new(table),
            dry_run: true,
            jobs: job_tx,
            outcomes: outcome_tx,
            cancel: CancellationToken::new(),
        };
        (ctx, job_rx, outcome_rx)
    }

    #[test]
    fn test_lines_become_jobs_or_failures() {
        let (ctx, mut jobs, mut outcomes) = context(16);
        let input = "idfa\tabc123\t67.7\t-37.3\t42,43,44\n\
                     idfa\tabc123\t67.7\t-37.3\n\
                     zzzz\tabc\t1\t2\t3\n\
                     gaid\tx\t1\t2\t5\n";
        let mut report = StageReport::default();

        ingest_reader(Cursor::new(input), &ctx, &mut report).unwrap();
        drop(ctx);

        assert!(report.complete);
        assert_eq!((report.lines, report.jobs, report.failures), (4, 2, 2));

        let first = jobs.blocking_recv().unwrap();
        assert_eq!(first.record.key(), "idfa:abc123");
        assert_eq!(first.endpoint.address, "127.0.0.1:33013");
        assert!(first.dry_run);
        assert_eq!(jobs.blocking_recv().unwrap().endpoint.address, "127.0.0.1:33014");
        assert!(jobs.blocking_recv().is_none());

        assert_eq!(
            outcomes.blocking_recv().unwrap(),
            Outcome::Failure(FailureReason::Parse(ParseError::MalformedLine { fields: 4 }))
        );
        assert_eq!(
            outcomes.blocking_recv().unwrap(),
            Outcome::Failure(FailureReason::UnknownDeviceType("zzzz".to_string()))
        );
    }

    #[test]
    fn test_invalid_utf8_is_a_parse_failure() {
        let (ctx, _jobs, mut outcomes) = context(4);
        let mut report = StageReport::default();

        ingest_reader(Cursor::new(b"idfa\t\xff\xfe\t1\t2\t3\n".to_vec()), &ctx, &mut report).unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(
            outcomes.blocking_recv().unwrap(),
            Outcome::Failure(FailureReason::Parse(ParseError::InvalidUtf8))
        );
    }

    #[test]
    fn test_cancelled_stage_stops_reading() {
        let (ctx, _jobs, _outcomes) = context(4);
        ctx.cancel.cancel();
        let mut report = StageReport::default();

        ingest_reader(Cursor::new("idfa\ta\t1\t2\t3\n"), &ctx, &mut report).unwrap();

        assert_eq!(report.lines, 0);
        assert!(!report.complete);
    }

    #[test]
    fn test_closed_queue_leaves_file_incomplete() {
        let (ctx, jobs, _outcomes) = context(4);
        drop(jobs);
        let mut report = StageReport::default();

        ingest_reader(Cursor::new("idfa\ta\t1\t2\t3\nidfa\tb\t1\t2\t3\n"), &ctx, &mut report).unwrap();

        assert_eq!(report.lines, 1);
        assert_eq!(report.jobs, 0);
        assert!(!report.complete);
    }

    #[test]
    fn test_missing_file_is_not_complete() {
        let (ctx, _jobs, _outcomes) = context(4);
        let report = ingest_file(Path::new("/nonexistent/file.tsv.gz"), &ctx);

        assert_eq!(report.lines, 0);
        assert!(!report.complete);
    }
}
