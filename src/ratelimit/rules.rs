//! Rate limit rules and limit specification parsing.
//!
//! Limits are written as `"<count>/<unit>"` (for example `"5/minute"`), keyed by
//! an opaque category name. A category that has no entry is unrestricted.
//!
//! Category names are case-insensitive. The configuration loader lowercases
//! map keys, so `AuthLogin` and `authlogin` must resolve to the same limit
//! (and the same counter).

use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Count used when a limit specification cannot be parsed.
pub const DEFAULT_COUNT: u64 = 100;
/// Window (in seconds) used when a limit specification cannot be parsed.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Time unit accepted in a limit specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    /// Parse a unit name, accepting plurals and any letter case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let name = name.strip_suffix('s').unwrap_or(&name);
        match name {
            "second" | "sec" => Some(TimeUnit::Second),
            "minute" | "min" => Some(TimeUnit::Minute),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// A normalized limit: `count` admissions per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    /// Maximum admissions per window
    pub count: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl LimitRule {
    /// Create a rule from its parts.
    pub fn new(count: u64, window_seconds: u64) -> Self {
        Self {
            count,
            window_seconds,
        }
    }

    /// Strictly parse a `"<n>/<unit>"` specification.
    ///
    /// Returns `None` for anything malformed, including a zero count.
    pub fn parse(spec: &str) -> Option<Self> {
        let (count, unit) = spec.trim().split_once('/')?;
        let count: u64 = count.trim().parse().ok()?;
        if count == 0 {
            return None;
        }
        let unit = TimeUnit::from_name(unit)?;
        Some(Self::new(count, unit.seconds()))
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_seconds * 1000
    }
}

impl Default for LimitRule {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT, DEFAULT_WINDOW_SECS)
    }
}

impl fmt::Display for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.count, self.window_seconds)
    }
}

/// Parse a human-readable limit specification into `(count, window_seconds)`.
///
/// Never fails: a malformed specification logs a warning and yields the
/// default `(100, 60)` so that one bad entry cannot stop the process from
/// starting.
pub fn parse_limit(spec: &str) -> (u64, u64) {
    let rule = LimitRule::parse(spec).unwrap_or_else(|| {
        warn!(
            spec = %spec,
            default_count = DEFAULT_COUNT,
            default_window_secs = DEFAULT_WINDOW_SECS,
            "Malformed rate limit specification, using default"
        );
        LimitRule::default()
    });
    (rule.count, rule.window_seconds)
}

/// Canonical form of a category name.
pub fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase()
}

/// Limits indexed by normalized category.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, LimitRule>,
}

impl LimitTable {
    /// Build a table from raw `category -> "<n>/<unit>"` entries.
    pub fn from_specs<'a, I>(specs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let limits = specs
            .into_iter()
            .map(|(category, spec)| {
                let (count, window_seconds) = parse_limit(spec);
                (
                    normalize_category(category),
                    LimitRule::new(count, window_seconds),
                )
            })
            .collect();
        Self { limits }
    }

    /// Find the limit for a category, if it is restricted.
    pub fn find(&self, category: &str) -> Option<LimitRule> {
        self.limits.get(&normalize_category(category)).copied()
    }

    /// Number of restricted categories.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether no category is restricted.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
