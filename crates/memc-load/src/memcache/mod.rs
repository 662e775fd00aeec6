//! Cache client seam
//!
//! The writer only needs two operations from a cache endpoint: a cheap
//! liveness probe and a single `set`. [`CacheClient`] captures that so the
//! pipeline can run against a real memcached ([`MemcacheClient`]) or an
//! in-memory fake in tests.

mod client;

use async_trait::async_trait;

use crate::error::CacheError;

pub use client::{MemcacheClient, MAX_KEY_LENGTH};

/// Operations the writer performs against one cache endpoint.
///
/// Implementations must be safe to share between workers.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Check that the endpoint answers at all
    async fn ping(&self) -> Result<(), CacheError>;

    /// Store `value` under `key`
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
}

/// Whether memcached would accept `key` as-is.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && !key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("idfa:abc123"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("idfa:abc 123"));
        assert!(!is_valid_key("idfa:abc\r\n"));
        assert!(!is_valid_key(&"k".repeat(MAX_KEY_LENGTH + 1)));
        assert!(is_valid_key(&"k".repeat(MAX_KEY_LENGTH)));
    }
}
