//! Reconnect backoff for unresponsive cache endpoints
//!
//! When a ping fails, the writer probes the endpoint a bounded number of
//! times. Before probe `n` (0-indexed) it sleeps
//!
//! ```text
//! delay(n) = base_delay + n * step + jitter(0 .. max_jitter)
//! ```
//!
//! With the defaults that is roughly 0.1s-1.1s, 0.6s-1.6s and 1.1s-2.1s.
//! Jitter comes from an injected [`JitterSource`], so tests can pin it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Produces the random part of a backoff delay
pub trait JitterSource: Send + Sync {
    /// A duration in `[0, max)`; zero when `max` is zero
    fn jitter(&self, max: Duration) -> Duration;
}

/// Seedable pseudo-random jitter. Not suitable for anything security related.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Seeded from OS entropy
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

impl JitterSource for SeededJitter {
    fn jitter(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Duration::from_millis(rng.random_range(0..max_ms))
    }
}

/// Always zero
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Bounded, linearly growing reconnect schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Probes after the initial failed ping
    pub max_probes: u32,
    /// Fixed part of every delay
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Added once per previous probe
    #[serde(with = "millis")]
    pub step: Duration,
    /// Upper bound (exclusive) of the random part
    #[serde(with = "millis")]
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_probes: 3,
            base_delay: Duration::from_millis(100),
            step: Duration::from_millis(500),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// No waiting at all; same number of probes as the default.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            step: Duration::ZERO,
            max_jitter: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before probe `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        self.base_delay + self.step * attempt + jitter.jitter(self.max_jitter)
    }
}

/// Shared handle to a jitter source
pub type SharedJitter = Arc<dyn JitterSource>;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
