//! Caller identifier resolution and counter key generation.
//!
//! # Trust boundary
//!
//! A forwarded-for chain is only meaningful when the service sits behind a
//! proxy that overwrites it. Exposed directly to clients, the chain is
//! attacker-controlled and lets any caller pick its own quota key. Callers of
//! [`resolve_identifier`] must only pass a chain they received from a trusted
//! proxy.

use std::fmt;

use super::Strategy;

/// Derive the per-caller quota key from connection metadata.
///
/// Uses the left-most (originating client) entry of `forwarded_chain` when
/// present, the direct peer address otherwise. A principal ID is appended as
/// `address:principal` so callers sharing one address get independent quotas.
pub fn resolve_identifier(
    peer_address: &str,
    forwarded_chain: &[String],
    principal_id: Option<&str>,
) -> String {
    let address = forwarded_chain
        .iter()
        .map(|entry| entry.trim())
        .find(|entry| !entry.is_empty())
        .unwrap_or(peer_address);

    match principal_id {
        Some(principal) if !principal.is_empty() => format!("{}:{}", address, principal),
        _ => address.to_string(),
    }
}

/// Split an `X-Forwarded-For` header value into its hops.
pub fn split_forwarded_for(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .collect()
}

/// A key that uniquely identifies a counter in the store.
///
/// The key is composed of the strategy, the category and the caller
/// identifier, so the two strategies never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Key namespace prefix
    pub prefix: String,
    /// The counting strategy this key belongs to
    pub strategy: Strategy,
    /// The limited category
    pub category: String,
    /// The caller identifier
    pub identifier: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(prefix: &str, strategy: Strategy, category: &str, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            strategy,
            category: category.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Convert the counter key to its store representation.
    pub fn to_string_key(&self) -> String {
        match self.strategy {
            Strategy::SlidingWindow => {
                format!("{}:{}:{}", self.prefix, self.category, self.identifier)
            }
            Strategy::TokenBucket => {
                format!("{}:bucket:{}:{}", self.prefix, self.category, self.identifier)
            }
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
