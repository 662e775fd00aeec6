//! Test helpers: an in-memory cache endpoint with scripted behaviour
//!
//! # Examples
//!
//! ```rust,ignore
//! use memc_load::testing::ScriptedCache;
//!
//! // Two failed pings, then healthy; every set is stored.
//! let cache = ScriptedCache::healthy().with_ping_failures(2);
//!
//! // Answers pings but refuses every write.
//! let cache = ScriptedCache::healthy().rejecting("SERVER_ERROR out of memory");
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::memcache::CacheClient;

#[derive(Debug, Clone)]
enum SetBehaviour {
    Store,
    Reject(String),
    Drop,
}

/// Fake [`CacheClient`] that counts calls and keeps written values
#[derive(Debug)]
pub struct ScriptedCache {
    address: String,
    ping_script: Mutex<VecDeque<bool>>,
    ping_default: bool,
    set_behaviour: SetBehaviour,
    set_delay: Duration,
    pings: AtomicUsize,
    sets: AtomicUsize,
    stored: Mutex<HashMap<String, Vec<u8>>>,
}

impl ScriptedCache {
    /// Answers every ping and stores every value
    pub fn healthy() -> Self {
        Self {
            address: "fake:11211".to_string(),
            ping_script: Mutex::new(VecDeque::new()),
            ping_default: true,
            set_behaviour: SetBehaviour::Store,
            set_delay: Duration::ZERO,
            pings: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Never answers a ping
    pub fn down() -> Self {
        Self {
            ping_default: false,
            ..Self::healthy()
        }
    }

    /// The first `count` pings fail, later ones follow the default
    pub fn with_ping_failures(self, count: usize) -> Self {
        self.ping_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(std::iter::repeat(false).take(count));
        self
    }

    /// Every set is answered with `response`
    pub fn rejecting(mut self, response: impl Into<String>) -> Self {
        self.set_behaviour = SetBehaviour::Reject(response.into());
        self
    }

    /// Pings succeed, but the connection drops during every set
    pub fn dropping_sets(mut self) -> Self {
        self.set_behaviour = SetBehaviour::Drop;
        self
    }

    /// Each set sleeps for `delay` before answering
    pub fn with_set_delay(mut self, delay: Duration) -> Self {
        self.set_delay = delay;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Value last stored under `key`
    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.stored
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    pub fn stored_len(&self) -> usize {
        self.stored.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl CacheClient for ScriptedCache {
    async fn ping(&self) -> Result<(), CacheError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let answered = self
            .ping_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(self.ping_default);

        if answered {
            Ok(())
        } else {
            Err(CacheError::unreachable(&self.address, "connection refused"))
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if !self.set_delay.is_zero() {
            tokio::time::sleep(self.set_delay).await;
        }

        match &self.set_behaviour {
            SetBehaviour::Store => {
                self.stored
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(key.to_string(), value.to_vec());
                Ok(())
            },
            SetBehaviour::Reject(response) => Err(CacheError::rejected(&self.address, response.clone())),
            SetBehaviour::Drop => Err(CacheError::unreachable(&self.address, "connection reset by peer")),
        }
    }
}
