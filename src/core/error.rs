use thiserror::Error;

use super::Fingerprint;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiveQueryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Dependency resolution failed: {0}")]
    DependencyResolution(String),

    #[error("Row cache has no entry for fingerprint '{fingerprint}'")]
    CacheConsistency { fingerprint: Fingerprint },

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LiveQueryError {
    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Parse(_) => "parse",
            Self::DependencyResolution(_) => "dependency_resolution",
            Self::CacheConsistency { .. } => "cache_consistency",
            Self::Watcher(_) => "watcher",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveQueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LiveQueryError::CacheConsistency {
            fingerprint: Fingerprint::new("abc"),
        };
        assert_eq!(err.to_string(), "Row cache has no entry for fingerprint 'abc'");
        assert_eq!(err.kind(), "cache_consistency");

        let err = LiveQueryError::Connection("refused".into());
        assert_eq!(err.to_string(), "Connection error: refused");
    }
}
