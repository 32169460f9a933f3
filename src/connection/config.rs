use std::time::Duration;

use crate::core::{LiveQueryError, Result};

/// Live query configuration
///
/// Shared by every controller created from the same
/// [`LiveQueryContext`](crate::live::LiveQueryContext).
#[derive(Debug, Clone)]
pub struct LiveQueryConfig {
    /// Minimum time between the start of two refreshes of one live query
    pub throttle_interval: Duration,

    /// Maximum number of memoized dependency sets
    pub dependency_cache_capacity: usize,

    /// Name given to the wrapped user query inside generated SQL
    pub query_alias: String,

    /// Column carrying the per-row content hash
    pub hash_column: String,

    /// Prefix of the temporary views created for dependency discovery
    pub view_prefix: String,
}

impl LiveQueryConfig {
    pub fn new() -> Self {
        Self {
            throttle_interval: Duration::from_millis(1000),
            dependency_cache_capacity: 1024,
            query_alias: "live_query".to_string(),
            hash_column: "_live_hash".to_string(),
            view_prefix: "live_deps_".to_string(),
        }
    }

    /// Set the refresh throttle interval
    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    /// Set the dependency cache capacity
    pub fn dependency_cache_capacity(mut self, capacity: usize) -> Self {
        self.dependency_cache_capacity = capacity;
        self
    }

    /// Set the alias of the wrapped user query
    pub fn query_alias(mut self, alias: &str) -> Self {
        self.query_alias = alias.to_string();
        self
    }

    /// Set the hash column name
    pub fn hash_column(mut self, column: &str) -> Self {
        self.hash_column = column.to_string();
        self
    }

    /// Set the dependency view prefix
    pub fn view_prefix(mut self, prefix: &str) -> Self {
        self.view_prefix = prefix.to_string();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.throttle_interval.is_zero() {
            return Err(LiveQueryError::Config(
                "throttle_interval must be > 0".to_string(),
            ));
        }

        if self.dependency_cache_capacity == 0 {
            return Err(LiveQueryError::Config(
                "dependency_cache_capacity must be > 0".to_string(),
            ));
        }

        for (field, value) in [
            ("query_alias", &self.query_alias),
            ("hash_column", &self.hash_column),
            ("view_prefix", &self.view_prefix),
        ] {
            if !is_identifier(value) {
                return Err(LiveQueryError::Config(format!(
                    "{} must be a plain SQL identifier, got '{}'",
                    field, value
                )));
            }
        }

        Ok(())
    }
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
