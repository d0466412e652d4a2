//! Shared counter stores.
//!
//! A [`CounterStore`] runs one complete rate limit step (read, decide, write)
//! as a single atomic operation. Two processes checking the same key can
//! never both observe the same headroom.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{QuotaGateError, Result};

/// Address scheme selecting the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Result of one sliding-window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether an entry was recorded for this request
    pub allowed: bool,
    /// Entries inside the window before this request
    pub count: u64,
    /// Timestamp (ms) of the oldest entry still inside the window
    pub oldest_ms: Option<u64>,
    /// Timestamp (ms) of the newest entry inside the window
    pub newest_ms: Option<u64>,
}

/// Result of one token-bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was consumed for this request
    pub allowed: bool,
    /// Tokens available after refill, before this request consumed one
    pub tokens: f64,
}

impl BucketOutcome {
    /// Tokens left once this request has been accounted for.
    pub fn tokens_after(&self) -> f64 {
        if self.allowed {
            self.tokens - 1.0
        } else {
            self.tokens
        }
    }
}

/// Trait for counter store implementations.
///
/// Both operations must be atomic with respect to every other caller of the
/// same key, including callers in other processes when the store is shared.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Drop entries at or before `now_ms - window_ms`, count the rest, and
    /// record `now_ms` only when the count is below `limit`.
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome>;

    /// Refill the bucket for the elapsed time (`capacity` tokens per
    /// `window_ms`), then consume one token if at least one is available.
    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome>;

    /// Verify the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release the store connection.
    async fn close(&self);

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Open the store named by `address` without performing any I/O.
///
/// `memory://` selects the in-process store; anything else is handed to the
/// Redis client. Reachability is checked separately with [`CounterStore::ping`].
pub fn open_store(address: &str, timeout: Duration) -> Result<Arc<dyn CounterStore>> {
    if address.trim().is_empty() {
        return Err(QuotaGateError::Config(
            "store_address must not be empty".to_string(),
        ));
    }

    if address.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryStore::new()));
    }

    Ok(Arc::new(RedisStore::open(address, timeout)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_store() {
        let store = open_store("memory://", Duration::from_millis(100)).unwrap();
        assert_eq!(store.backend(), "memory");
    }

    #[test]
    fn test_open_redis_store_does_not_connect() {
        // Nothing listens on port 1; opening must still succeed.
        let store = open_store("redis://127.0.0.1:1/", Duration::from_millis(100)).unwrap();
        assert_eq!(store.backend(), "redis");
    }

    #[test]
    fn test_open_rejects_bad_addresses() {
        let err = open_store("", Duration::from_millis(100)).err().unwrap();
        assert!(matches!(err, QuotaGateError::Config(_)));

        let err = open_store("not a url", Duration::from_millis(100)).err().unwrap();
        assert!(matches!(err, QuotaGateError::Config(_)));
    }

    #[test]
    fn test_bucket_tokens_after() {
        let allowed = BucketOutcome {
            allowed: true,
            tokens: 3.5,
        };
        assert!((allowed.tokens_after() - 2.5).abs() < f64::EPSILON);

        let denied = BucketOutcome {
            allowed: false,
            tokens: 0.25,
        };
        assert!((denied.tokens_after() - 0.25).abs() < f64::EPSILON);
    }
}
