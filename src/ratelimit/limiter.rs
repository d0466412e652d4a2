//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::identifier::CounterKey;
use super::rules::{normalize_category, LimitRule, LimitTable};
use crate::config::{RateLimitSettings, Strategy};
use crate::error::Result;
use crate::store::{open_store, BucketOutcome, CounterStore, WindowOutcome};

/// Outcome of one rate limit check.
///
/// When a limit applies, `remaining == limit - current` (never negative) and
/// `allowed == remaining > 0`. Checks that bypass limiting carry zeroed
/// metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Admissions allowed per window (0 when no limit applied)
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Usage observed before this request
    pub current: u64,
    /// Headroom observed before this request
    pub remaining: u64,
    /// Unix time (seconds, rounded up) at which the quota is fully restored
    pub reset_epoch: i64,
    /// Seconds to wait before retrying; 0 when admitted
    pub retry_after_seconds: u64,
    /// Admitted because the caller is privileged
    pub bypassed: bool,
}

impl Decision {
    /// Admit without applying any limit.
    pub fn unrestricted() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    /// Admit a privileged caller without touching the counter store.
    pub fn bypassed() -> Self {
        Self {
            allowed: true,
            bypassed: true,
            ..Self::default()
        }
    }

    /// Whether a limit was evaluated for this decision.
    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }

    /// Build a decision from one sliding-window step.
    fn from_window(rule: LimitRule, outcome: WindowOutcome, now_ms: u64) -> Self {
        let window_ms = rule.window_ms();
        let remaining = rule.count.saturating_sub(outcome.count);

        let newest = outcome.newest_ms.unwrap_or(now_ms);
        let reset_epoch = ceil_secs(newest + window_ms) as i64;

        let retry_after_seconds = if outcome.allowed {
            0
        } else {
            let oldest = outcome.oldest_ms.unwrap_or(now_ms);
            ceil_secs((oldest + window_ms).saturating_sub(now_ms)).max(1)
        };

        Self {
            allowed: outcome.allowed,
            limit: rule.count,
            window_seconds: rule.window_seconds,
            current: outcome.count.min(rule.count),
            remaining,
            reset_epoch,
            retry_after_seconds,
            bypassed: false,
        }
    }

    /// Build a decision from one token-bucket step.
    fn from_bucket(rule: LimitRule, outcome: BucketOutcome, now_ms: u64) -> Self {
        let capacity = rule.count as f64;
        let window_ms = rule.window_ms() as f64;

        let remaining = (outcome.tokens.max(0.0).floor() as u64).min(rule.count);

        let missing = (capacity - outcome.tokens_after()).max(0.0);
        let full_at_ms = now_ms + ceil_f64(missing * window_ms / capacity);
        let reset_epoch = ceil_secs(full_at_ms) as i64;

        let retry_after_seconds = if outcome.allowed {
            0
        } else {
            let wait_ms = ceil_f64((1.0 - outcome.tokens).max(0.0) * window_ms / capacity);
            ceil_secs(wait_ms).max(1)
        };

        Self {
            allowed: outcome.allowed,
            limit: rule.count,
            window_seconds: rule.window_seconds,
            current: rule.count - remaining,
            remaining,
            reset_epoch,
            retry_after_seconds,
            bypassed: false,
        }
    }
}

/// Milliseconds to whole seconds, rounded up.
fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Round a non-negative millisecond amount up, ignoring float noise.
fn ceil_f64(ms: f64) -> u64 {
    (ms - 1e-6).ceil().max(0.0) as u64
}

/// The core rate limiter.
///
/// One instance is built per process at startup and shared (via `Arc`) by
/// every handler. It holds the only counter store connection.
pub struct RateLimiter {
    settings: RateLimitSettings,
    limits: LimitTable,
    /// `None` when rate limiting is disabled
    store: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("limits", &self.limits)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter, opening the configured counter store.
    ///
    /// An unreachable store is tolerated when `fail_open` is set: the limiter
    /// starts degraded and retries the store on every check. Otherwise
    /// construction fails.
    pub async fn connect(settings: RateLimitSettings) -> Result<Self> {
        Self::connect_with_clock(settings, Arc::new(SystemClock::new())).await
    }

    /// Create a limiter reading time from `clock`.
    pub async fn connect_with_clock(
        settings: RateLimitSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        if !settings.enabled {
            info!("Rate limiting disabled; counter store not opened");
            return Ok(Self {
                limits: settings.limit_table(),
                settings,
                store: None,
                clock,
            });
        }

        let store = open_store(&settings.store_address, settings.store_timeout())?;
        Self::with_store(settings, store, clock).await
    }

    /// Create a limiter around an already opened counter store.
    pub async fn with_store(
        settings: RateLimitSettings,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        if settings.enabled {
            if let Err(e) = store.ping().await {
                if !settings.fail_open {
                    return Err(e);
                }
                warn!(
                    error = %e,
                    backend = store.backend(),
                    "Counter store unavailable at startup; continuing in fail-open mode"
                );
            }
        }

        let limits = settings.limit_table();
        if limits.is_empty() {
            warn!("No rate limits configured; every category is unrestricted");
        }
        info!(
            backend = store.backend(),
            strategy = %settings.strategy,
            categories = limits.len(),
            fail_open = settings.fail_open,
            "Rate limiter initialized"
        );

        Ok(Self {
            settings,
            limits,
            store: Some(store),
            clock,
        })
    }

    /// Decide whether `identifier` may perform an operation in `category`.
    ///
    /// A denial is a normal `Ok` decision. `Err` is only returned when the
    /// counter store is unavailable and `fail_open` is off.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        category: &str,
        is_admin: bool,
    ) -> Result<Decision> {
        let store = match &self.store {
            Some(store) if self.settings.enabled => store,
            _ => return Ok(Decision::unrestricted()),
        };

        if is_admin && self.settings.admin_bypass {
            trace!(identifier = %identifier, category = %category, "Admin bypass");
            return Ok(Decision::bypassed());
        }

        let category = normalize_category(category);
        let rule = match self.limits.find(&category) {
            Some(rule) => rule,
            None => return Ok(Decision::unrestricted()),
        };

        let strategy = self.settings.strategy;
        let key = CounterKey::new(&self.settings.key_prefix, strategy, &category, identifier);
        let now_ms = self.clock.now_millis();
        let window_ms = rule.window_ms();

        trace!(key = %key, limit = %rule, "Checking rate limit");

        let key_str = key.to_string_key();
        let result = match strategy {
            Strategy::SlidingWindow => store
                .sliding_window(&key_str, rule.count, window_ms, now_ms)
                .await
                .map(|outcome| Decision::from_window(rule, outcome, now_ms)),
            Strategy::TokenBucket => store
                .token_bucket(&key_str, rule.count, window_ms, now_ms)
                .await
                .map(|outcome| Decision::from_bucket(rule, outcome, now_ms)),
        };

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        limit = decision.limit,
                        retry_after = decision.retry_after_seconds,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) if self.settings.fail_open => {
                warn!(
                    error = %e,
                    key = %key,
                    "Counter store unavailable; admitting request (fail-open)"
                );
                Ok(Decision::unrestricted())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the counter store connection.
    pub async fn close(&self) {
        if let Some(store) = &self.store {
            store.close().await;
            info!(backend = store.backend(), "Rate limiter closed");
        }
    }
}
