//! Rate limiting logic: limit rules, caller identifiers and the limiter core.

mod clock;
mod identifier;
mod limiter;
mod rules;

pub use clock::{Clock, MockClock, SystemClock};
pub use identifier::{resolve_identifier, split_forwarded_for, CounterKey};
pub use limiter::{Decision, RateLimiter};
pub use rules::{
    normalize_category, parse_limit, LimitRule, LimitTable, TimeUnit, DEFAULT_COUNT, DEFAULT_WINDOW_SECS,
};

pub use crate::config::Strategy;
