//! Worker pool draining the job queue
//!
//! `W` tasks share one receiver. A worker exits when the queue is closed and
//! empty, when the outcome queue is gone, or when the run is cancelled.
//! Cancellation is checked between jobs only, so an in-flight write always
//! finishes and reports.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use super::{Job, Outcome};
use crate::error::Result;
use crate::writer::CacheWriter;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Running workers of one run
pub struct WorkerPool {
    workers: JoinSet<u64>,
}

impl WorkerPool {
    /// Spawn `count` workers. The pool takes the only handle to `jobs`;
    /// once every worker is gone the job queue is closed for producers too.
    pub fn spawn(
        count: usize,
        jobs: mpsc::Receiver<Job>,
        outcomes: mpsc::Sender<Outcome>,
        writer: CacheWriter,
        cancel: CancellationToken,
    ) -> Self {
        let receiver: SharedReceiver = Arc::new(Mutex::new(jobs));
        let mut workers = JoinSet::new();

        for id in 0..count.max(1) {
            let span = tracing::debug_span!("worker", id);
            workers.spawn(
                run_worker(
                    receiver.clone(),
                    outcomes.clone(),
                    writer.clone(),
                    cancel.clone(),
                )
                .instrument(span),
            );
        }

        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker; returns the number of jobs handled.
    pub async fn join(mut self) -> Result<u64> {
        let mut handled = 0;
        while let Some(result) = self.workers.join_next().await {
            handled += result?;
        }
        Ok(handled)
    }
}

async fn run_worker(
    jobs: SharedReceiver,
    outcomes: mpsc::Sender<Outcome>,
    writer: CacheWriter,
    cancel: CancellationToken,
) -> u64 {
    let mut handled = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = async { jobs.lock().await.recv().await } => job,
        };
        let Some(job) = next else {
            break;
        };

        let outcome = writer.write(&job).await;
        handled += 1;

        let fatal = match &outcome {
            Outcome::Fatal(signal) => {
                error!(
                    "Memcached at {} rejected a write, aborting run: {}",
                    signal.address, signal.message
                );
                true
            },
            Outcome::Failure(reason) => {
                debug!(key = %job.record.key(), "Write failed: {}", reason);
                false
            },
            Outcome::Success => false,
        };

        if outcomes.send(outcome).await.is_err() {
            break;
        }
        if fatal {
            cancel.cancel();
            break;
        }
    }

    debug!(handled, "Worker finished");
    handled
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::endpoints::Endpoint;
    use crate::record::parse_line;
    use crate::retry::{BackoffPolicy, NoJitter};
    use crate::testing::ScriptedCache;

    fn job(cache: &Arc<ScriptedCache>, id: usize) -> Job {
        Job {
            record: parse_line(&format!("idfa\tdev{id}\t1\t2\t3")).unwrap(),
            endpoint: Endpoint {
                address: "127.0.0.1:33013".to_string(),
                client: cache.clone(),
            },
            dry_run: false,
        }
    }

    fn writer() -> CacheWriter {
        CacheWriter::new(BackoffPolicy::immediate(), Arc::new(NoJitter))
    }

    #[tokio::test]
    async fn test_workers_drain_queue_then_exit() {
        let cache = Arc::new(ScriptedCache::healthy());
        let (job_tx, job_rx) = mpsc::channel(4);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(64);

        let pool = WorkerPool::spawn(3, job_rx, outcome_tx, writer(), CancellationToken::new());
        assert_eq!(pool.len(), 3);

        for id in 0..20 {
            job_tx.send(job(&cache, id)).await.unwrap();
        }
        drop(job_tx);

        assert_eq!(pool.join().await.unwrap(), 20);
        let mut successes = 0;
        while let Some(outcome) = outcome_rx.recv().await {
            assert_eq!(outcome, Outcome::Success);
            successes += 1;
        }
        assert_eq!(successes, 20);
        assert_eq!(cache.stored_len(), 20);
    }

    #[tokio::test]
    async fn test_fatal_outcome_cancels_run() {
        let cache = Arc::new(ScriptedCache::healthy().rejecting("SERVER_ERROR"));
        let (job_tx, job_rx) = mpsc::channel(16);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for id in 0..10 {
            job_tx.send(job(&cache, id)).await.unwrap();
        }

        let pool = WorkerPool::spawn(1, job_rx, outcome_tx, writer(), cancel.clone());
        assert_eq!(pool.join().await.unwrap(), 1);

        assert!(cancel.is_cancelled());
        assert!(matches!(outcome_rx.recv().await, Some(Outcome::Fatal(_))));
        assert!(outcome_rx.recv().await.is_none());
        // queue closed for producers once the workers are gone
        assert!(job_tx.send(job(&cache, 99)).await.is_err());
    }
}
