//! In-process counter store.
//!
//! Runs the same two algorithms as the Redis store under a per-key lock. State
//! lives in this process only, so this store is correct for a single instance
//! (and for tests) but gives no cross-process guarantees.
//!
//! Keys expire like their Redis counterparts: a key untouched for one window is
//! dropped by a sweep that piggybacks on regular checks, at most once per
//! [`SWEEP_INTERVAL_MS`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BucketOutcome, CounterStore, WindowOutcome};
use crate::error::Result;

/// Timestamps of admitted requests, oldest first.
#[derive(Debug, Default)]
struct WindowLog {
    entries: VecDeque<u64>,
    window_ms: u64,
}

impl WindowLog {
    fn trim(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while matches!(self.entries.front(), Some(&ts) if ts <= cutoff) {
            self.entries.pop_front();
        }
    }

    fn record(&mut self, now_ms: u64) {
        let at = self.entries.partition_point(|&ts| ts <= now_ms);
        self.entries.insert(at, now_ms);
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        match self.entries.back() {
            Some(&newest) => newest + self.window_ms <= now_ms,
            None => true,
        }
    }
}

/// Token bucket state.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
    window_ms: u64,
}

impl Bucket {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.last_refill_ms + self.window_ms <= now_ms
    }
}

/// Minimum time between two expiry sweeps.
pub const SWEEP_INTERVAL_MS: u64 = 1_000;

/// In-process counter store backed by concurrent maps.
///
/// The maps hold one mutex per key; a check takes a shard read lock plus that
/// key's mutex, so checks on different keys do not serialize.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, Mutex<WindowLog>>,
    buckets: DashMap<String, Mutex<Bucket>>,
    last_sweep_ms: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently recorded for a sliding-window key.
    pub fn window_len(&self, key: &str) -> usize {
        self.windows
            .get(key)
            .map(|log| log.lock().entries.len())
            .unwrap_or(0)
    }

    /// Number of keys held, across both strategies.
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    /// Drop keys whose TTL would have elapsed by `now_ms`.
    pub fn purge_expired(&self, now_ms: u64) {
        let before = self.key_count();
        self.windows.retain(|_, log| !log.get_mut().is_expired(now_ms));
        self.buckets
            .retain(|_, bucket| !bucket.get_mut().is_expired(now_ms));

        let purged = before.saturating_sub(self.key_count());
        if purged > 0 {
            debug!(purged = purged, "Purged expired counter keys");
        }
    }

    /// Purge expired keys if the last sweep is older than the sweep interval.
    ///
    /// Must be called without holding any map guard.
    fn maybe_purge(&self, now_ms: u64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms < last.saturating_add(SWEEP_INTERVAL_MS) {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_expired(now_ms);
        }
    }

    fn window_entry(&self, key: &str) -> Ref<'_, String, Mutex<WindowLog>> {
        if let Some(entry) = self.windows.get(key) {
            return entry;
        }
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(WindowLog::default()))
            .downgrade()
    }

    fn bucket_entry(
        &self,
        key: &str,
        capacity: f64,
        window_ms: u64,
        now_ms: u64,
    ) -> Ref<'_, String, Mutex<Bucket>> {
        if let Some(entry) = self.buckets.get(key) {
            return entry;
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: capacity,
                    last_refill_ms: now_ms,
                    window_ms,
                })
            })
            .downgrade()
    }

    /// Clear all state.
    pub fn clear(&self) {
        self.windows.clear();
        self.buckets.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        self.maybe_purge(now_ms);

        let entry = self.window_entry(key);
        let mut log = entry.lock();

        log.window_ms = window_ms;
        log.trim(now_ms);

        let count = log.entries.len() as u64;
        let allowed = count < limit;
        if allowed {
            log.record(now_ms);
        }

        trace!(key = %key, count = count, allowed = allowed, "Sliding window step");

        Ok(WindowOutcome {
            allowed,
            count,
            oldest_ms: log.entries.front().copied(),
            newest_ms: log.entries.back().copied(),
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome> {
        let capacity_f = capacity as f64;

        self.maybe_purge(now_ms);

        let entry = self.bucket_entry(key, capacity_f, window_ms, now_ms);
        let mut bucket = entry.lock();

        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms) as f64;
        let tokens = (bucket.tokens + elapsed * capacity_f / window_ms as f64).min(capacity_f);
        let allowed = tokens >= 1.0;

        bucket.tokens = if allowed { tokens - 1.0 } else { tokens };
        bucket.last_refill_ms = bucket.last_refill_ms.max(now_ms);
        bucket.window_ms = window_ms;

        trace!(key = %key, tokens = tokens, allowed = allowed, "Token bucket step");

        Ok(BucketOutcome { allowed, tokens })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.clear();
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
