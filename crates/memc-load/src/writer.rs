//! Cache writer: one job in, one outcome out
//!
//! A write goes through three steps:
//! 1. Check the key would be accepted by memcached.
//! 2. Ping the endpoint, probing again with [`BackoffPolicy`] delays while it
//!    stays silent.
//! 3. `set` the serialized record.
//!
//! An endpoint that never answers costs the job, not the run. An endpoint
//! that answers and refuses the write is fatal.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::CacheError;
use crate::memcache::is_valid_key;
use crate::pipeline::{FailureReason, FatalSignal, Job, Outcome};
use crate::proto::UserApps;
use crate::retry::{BackoffPolicy, SharedJitter};

/// What a dry run would have written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunEntry {
    pub address: String,
    pub key: String,
    /// App ids joined by single spaces
    pub apps: String,
}

/// Sink for dry-run writes
pub trait DryRunRecorder: Send + Sync {
    fn record(&self, entry: DryRunEntry);
}

/// Logs every dry-run write at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl DryRunRecorder for LogRecorder {
    fn record(&self, entry: DryRunEntry) {
        debug!("{} - {} -> {}", entry.address, entry.key, entry.apps);
    }
}

/// Keeps dry-run writes in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    entries: Mutex<Vec<DryRunEntry>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DryRunEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl DryRunRecorder for MemoryRecorder {
    fn record(&self, entry: DryRunEntry) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).push(entry);
    }
}

/// Writes jobs to their endpoint, shared by every worker of a run
#[derive(Clone)]
pub struct CacheWriter {
    policy: BackoffPolicy,
    jitter: SharedJitter,
    recorder: Arc<dyn DryRunRecorder>,
}

impl CacheWriter {
    pub fn new(policy: BackoffPolicy, jitter: SharedJitter) -> Self {
        Self {
            policy,
            jitter,
            recorder: Arc::new(LogRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn DryRunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn write(&self, job: &Job) -> Outcome {
        let key = job.record.key();
        let payload = UserApps::from(&job.record);

        if job.dry_run {
            self.recorder.record(DryRunEntry {
                address: job.endpoint.address.clone(),
                key,
                apps: payload.apps_display(),
            });
            return Outcome::Success;
        }

        if !is_valid_key(&key) {
            return Outcome::Failure(FailureReason::InvalidKey(key));
        }

        if !self.ensure_reachable(job).await {
            return Outcome::Failure(FailureReason::Unreachable {
                address: job.endpoint.address.clone(),
            });
        }

        match job.endpoint.client.set(&key, &payload.to_bytes()).await {
            Ok(()) => Outcome::Success,
            Err(CacheError::Unreachable { address, reason }) => {
                warn!(address = %address, key = %key, "Lost connection during set: {}", reason);
                Outcome::Failure(FailureReason::Unreachable { address })
            },
            Err(CacheError::Rejected { address, response }) => Outcome::Fatal(FatalSignal {
                address,
                message: response,
            }),
        }
    }

    /// Ping, then probe up to `max_probes` more times with backoff.
    async fn ensure_reachable(&self, job: &Job) -> bool {
        let client = &job.endpoint.client;
        if client.ping().await.is_ok() {
            return true;
        }

        for attempt in 0..self.policy.max_probes {
            let delay = self.policy.delay(attempt, self.jitter.as_ref());
            warn!(
                "{} is not responding, probe {}/{} in {:.2}s",
                job.endpoint.address,
                attempt + 1,
                self.policy.max_probes,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;

            if client.ping().await.is_ok() {
                debug!(address = %job.endpoint.address, "Endpoint is back");
                return true;
            }
        }

        warn!(
            "{} did not respond after {} probes, dropping {}",
            job.endpoint.address,
            self.policy.max_probes,
            job.record.key()
        );
        false
    }
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::endpoints::Endpoint;
    use crate::record::parse_line;
    use crate::retry::NoJitter;
    use crate::testing::ScriptedCache;
    use std::time::Duration;

    fn job(cache: Arc<ScriptedCache>, line: &str, dry_run: bool) -> Job {
        Job {
            record: parse_line(line).unwrap(),
            endpoint: Endpoint {
                address: "127.0.0.1:33013".to_string(),
                client: cache,
            },
            dry_run,
        }
    }

    fn writer() -> CacheWriter {
        CacheWriter::new(BackoffPolicy::immediate(), Arc::new(NoJitter))
    }

    #[tokio::test]
    async fn test_successful_write_stores_protobuf() {
        let cache = Arc::new(ScriptedCache::healthy());
        let outcome = writer()
            .write(&job(cache.clone(), "idfa\tabc123\t67.7\t-37.3\t42,43,44", false))
            .await;

        assert_eq!(outcome, Outcome::Success);
        let stored = cache.stored("idfa:abc123").unwrap();
        let decoded = UserApps::from_bytes(&stored).unwrap();
        assert_eq!(decoded.apps, vec![42, 43, 44]);
        assert_eq!(decoded.lat, Some(67.7));
    }

    #[tokio::test]
    async fn test_recovers_after_failed_pings() {
        let cache = Arc::new(ScriptedCache::healthy().with_ping_failures(2));
        let outcome = writer()
            .write(&job(cache.clone(), "idfa\tabc\t1\t2\t3", false))
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(cache.ping_count(), 3);
        assert_eq!(cache.set_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_probes_is_unreachable() {
        let cache = Arc::new(ScriptedCache::down());
        let outcome = writer()
            .write(&job(cache.clone(), "idfa\tabc\t1\t2\t3", false))
            .await;

        assert_eq!(
            outcome,
            Outcome::Failure(FailureReason::Unreachable {
                address: "127.0.0.1:33013".to_string()
            })
        );
        assert_eq!(cache.ping_count(), 4);
        assert_eq!(cache.set_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_probes() {
        let cache = Arc::new(ScriptedCache::down());
        let policy = BackoffPolicy {
            max_jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        };
        let writer = CacheWriter::new(policy, Arc::new(NoJitter));

        let started = tokio::time::Instant::now();
        writer.write(&job(cache, "idfa\tabc\t1\t2\t3", false)).await;

        // 100ms + 600ms + 1100ms
        assert!(started.elapsed() >= Duration::from_millis(1800));
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let cache = Arc::new(ScriptedCache::healthy().rejecting("SERVER_ERROR out of memory"));
        let outcome = writer()
            .write(&job(cache, "idfa\tabc\t1\t2\t3", false))
            .await;

        match outcome {
            Outcome::Fatal(signal) => {
                assert_eq!(signal.address, "fake:11211");
                assert_eq!(signal.message, "SERVER_ERROR out of memory");
            },
            other => panic!("expected fatal outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_during_set_is_not_fatal() {
        let cache = Arc::new(ScriptedCache::healthy().dropping_sets());
        let outcome = writer()
            .write(&job(cache, "idfa\tabc\t1\t2\t3", false))
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failure(FailureReason::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_key_is_skipped() {
        let cache = Arc::new(ScriptedCache::healthy());
        let long_id = "x".repeat(300);
        let outcome = writer()
            .write(&job(cache.clone(), &format!("idfa\t{long_id}\t1\t2\t3"), false))
            .await;

        assert!(matches!(outcome, Outcome::Failure(FailureReason::InvalidKey(_))));
        assert_eq!(cache.ping_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_records_without_io() {
        let cache = Arc::new(ScriptedCache::down());
        let recorder = Arc::new(MemoryRecorder::new());
        let writer = writer().with_recorder(recorder.clone());

        let outcome = writer
            .write(&job(cache.clone(), "idfa\tabc123\t67.7\t-37.3\t42,43,44", true))
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(cache.ping_count(), 0);
        assert_eq!(
            recorder.entries(),
            vec![DryRunEntry {
                address: "127.0.0.1:33013".to_string(),
                key: "idfa:abc123".to_string(),
                apps: "42 43 44".to_string(),
            }]
        );
    }
}
