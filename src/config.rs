//! Configuration management for Quotagate.
//!
//! Configuration is loaded once at startup from an optional file (YAML, TOML
//! or JSON, by extension) overlaid with `QUOTAGATE__*` environment variables,
//! e.g. `QUOTAGATE__RATE_LIMIT__FAIL_OPEN=false`. Unknown keys are rejected.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{QuotaGateError, Result};
use crate::ratelimit::LimitTable;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaGateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Honour `X-Forwarded-For` when resolving caller identifiers.
    ///
    /// Only enable this when every request reaches the service through a
    /// proxy that overwrites the header; otherwise callers can choose their
    /// own quota key.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Honour `X-Principal-Id` / `X-Principal-Admin` on the admission service.
    ///
    /// Only enable this when the authenticating proxy strips those headers
    /// from client requests; otherwise any client can claim to be an admin.
    #[serde(default)]
    pub trust_principal_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
            trust_principal_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Counting strategy, chosen once per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Strict bound on events per rolling window
    #[default]
    SlidingWindow,
    /// Bursts up to the limit, refilled continuously
    TokenBucket,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::SlidingWindow => write!(f, "sliding_window"),
            Strategy::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Master switch; when false every check is admitted without store access
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Counter store address (`redis://...` or `memory://`)
    #[serde(default = "default_store_address")]
    pub store_address: String,

    /// Admit requests when the counter store is unavailable
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Counting strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Skip rate limiting entirely for privileged callers
    #[serde(default = "default_true")]
    pub admin_bypass: bool,

    /// Category to `"<n>/<unit>"` limit specification
    #[serde(default, deserialize_with = "deserialize_limits")]
    pub limits: HashMap<String, String>,

    /// Upper bound on one counter store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Namespace prefix for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            store_address: default_store_address(),
            fail_open: true,
            strategy: Strategy::default(),
            admin_bypass: true,
            limits: HashMap::new(),
            store_timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// A limit value as written in a config file.
///
/// Non-string scalars (`login: 5`) are kept as text so that they reach the
/// limit parser, which warns and substitutes the default, instead of failing
/// the whole load.
#[derive(Deserialize)]
#[serde(untagged)]
enum LimitValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Text(v) => write!(f, "{}", v),
            LimitValue::Integer(v) => write!(f, "{}", v),
            LimitValue::Float(v) => write!(f, "{}", v),
            LimitValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

fn deserialize_limits<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, LimitValue> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(category, value)| (category, value.to_string()))
        .collect())
}

fn default_true() -> bool {
    true
}

fn default_store_address() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl RateLimitSettings {
    /// Store round-trip timeout as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Parse the configured limits. Malformed entries fall back to the
    /// default limit rather than failing.
    pub fn limit_table(&self) -> LimitTable {
        LimitTable::from_specs(&self.limits)
    }

    /// Reject values that cannot be recovered by substituting a default.
    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(QuotaGateError::Config(
                "rate_limit.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(QuotaGateError::Config(format!(
                "rate_limit.key_prefix {:?} must be non-empty and contain no whitespace",
                self.key_prefix
            )));
        }
        if self.enabled && self.store_address.trim().is_empty() {
            return Err(QuotaGateError::Config(
                "rate_limit.store_address is required when rate limiting is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl QuotaGateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: QuotaGateConfig = builder.build()?.try_deserialize()?;
        config.rate_limit.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGateError::Config(e.to_string()))?;
        config.rate_limit.validate()?;
        Ok(config)
    }
}
