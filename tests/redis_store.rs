//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! They are ignored by default; run with `cargo test --test redis_store -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quotagate::config::{RateLimitSettings, Strategy};
use quotagate::ratelimit::{MockClock, RateLimiter};
use quotagate::store::{CounterStore, RedisStore};
use redis::AsyncCommands;
use tokio_test::{assert_err, assert_ok};

const REDIS_URL: &str = "redis://127.0.0.1/";
const START_MS: u64 = 1_700_000_000_000;

/// Check if Redis is available before running tests
async fn redis_available() -> bool {
    RedisStore::connect(REDIS_URL, Duration::from_millis(500))
        .await
        .is_ok()
}

/// Settings with a unique key prefix so tests never share counters.
fn test_settings(test_name: &str, strategy: Strategy, limit: &str) -> RateLimitSettings {
    let mut limits = HashMap::new();
    limits.insert("api".to_string(), limit.to_string());
    RateLimitSettings {
        store_address: REDIS_URL.to_string(),
        strategy,
        fail_open: false,
        store_timeout_ms: 2_000,
        key_prefix: format!("test-{}-{}", test_name, uuid::Uuid::new_v4()),
        limits,
        ..RateLimitSettings::default()
    }
}

/// Several limiter instances over separate connections, as separate processes
/// would have.
async fn limiters(settings: &RateLimitSettings, count: usize) -> Vec<Arc<RateLimiter>> {
    let mut limiters = Vec::with_capacity(count);
    for _ in 0..count {
        let limiter = RateLimiter::connect(settings.clone())
            .await
            .expect("Failed to connect to Redis");
        limiters.push(Arc::new(limiter));
    }
    limiters
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sequential_sliding_window() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available at {}", REDIS_URL);
        return;
    }

    let settings = test_settings("sequential", Strategy::SlidingWindow, "5/minute");
    let limiter = RateLimiter::connect(settings).await.unwrap();

    for i in 0..10 {
        let decision = assert_ok!(limiter.check_rate_limit("client1", "api", false).await);
        if i < 5 {
            assert!(decision.allowed, "call {} should be admitted", i + 1);
        } else {
            assert!(!decision.allowed, "call {} should be denied", i + 1);
            assert!(decision.retry_after_seconds > 0);
        }
    }

    limiter.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Requires Redis
async fn test_concurrent_burst_across_instances() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let settings = test_settings("burst", Strategy::SlidingWindow, "25/minute");
    let limiters = limiters(&settings, 4).await;

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let limiter = limiters[i % limiters.len()].clone();
            tokio::spawn(async move { limiter.check_rate_limit("burst", "api", false).await })
        })
        .collect();

    let mut admitted = 0;
    let mut denied = 0;
    for result in futures::future::join_all(tasks).await {
        let decision = result.unwrap().unwrap();
        if decision.allowed {
            admitted += 1;
        } else {
            denied += 1;
        }
    }

    assert_eq!(admitted, 25);
    assert_eq!(denied, 175);

    for limiter in limiters {
        limiter.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Requires Redis
async fn test_concurrent_token_bucket_across_instances() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    // A day-long window keeps refill negligible during the test.
    let settings = test_settings("bucket", Strategy::TokenBucket, "30/day");
    let limiters = limiters(&settings, 4).await;

    let tasks: Vec<_> = (0..120)
        .map(|i| {
            let limiter = limiters[i % limiters.len()].clone();
            tokio::spawn(async move { limiter.check_rate_limit("bucket", "api", false).await })
        })
        .collect();

    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(d)) if d.allowed))
        .count();

    assert_eq!(admitted, 30);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sliding_window_resets_with_mock_clock() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let settings = test_settings("reset", Strategy::SlidingWindow, "3/second");
    let clock = MockClock::new(START_MS);
    let limiter = RateLimiter::connect_with_clock(settings, Arc::new(clock.clone()))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(limiter.check_rate_limit("c", "api", false).await.unwrap().allowed);
    }
    assert!(!limiter.check_rate_limit("c", "api", false).await.unwrap().allowed);

    clock.advance(Duration::from_millis(1_100));
    assert!(limiter.check_rate_limit("c", "api", false).await.unwrap().allowed);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_admin_bypass_leaves_redis_untouched() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let settings = test_settings("bypass", Strategy::SlidingWindow, "5/minute");
    let key = format!("{}:api:admin", settings.key_prefix);
    let limiter = RateLimiter::connect(settings).await.unwrap();

    limiter.check_rate_limit("admin", "api", false).await.unwrap();

    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let before: u64 = conn.zcard(&key).await.unwrap();

    for _ in 0..10 {
        let decision = limiter.check_rate_limit("admin", "api", true).await.unwrap();
        assert!(decision.bypassed);
    }

    let after: u64 = conn.zcard(&key).await.unwrap();
    assert_eq!(before, 1);
    assert_eq!(before, after);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_keys_carry_ttl() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = RedisStore::connect(REDIS_URL, Duration::from_secs(2)).await.unwrap();
    let key = format!("test-ttl-{}", uuid::Uuid::new_v4());

    let outcome = store.sliding_window(&key, 5, 60_000, START_MS).await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.oldest_ms, Some(START_MS));

    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let ttl: i64 = conn.pttl(&key).await.unwrap();
    assert!(ttl > 0 && ttl <= 60_000, "unexpected ttl {}", ttl);
}

#[tokio::test]
async fn test_unreachable_redis_fail_closed() {
    let settings = RateLimitSettings {
        store_address: "redis://127.0.0.1:1/".to_string(),
        fail_open: false,
        store_timeout_ms: 200,
        ..RateLimitSettings::default()
    };
    assert_err!(RateLimiter::connect(settings).await);
}
