pub mod config;

use async_trait::async_trait;

use crate::core::{Result, Value};
use crate::result::QueryResult;

pub use config::LiveQueryConfig;

/// A checked-out database connection.
///
/// Statements use positional `$n` placeholders bound to `params` in order.
/// Implementations wrap a real driver (or a test double); the connection is
/// given back to its pool when the boxed executor is dropped.
#[async_trait]
pub trait QueryExecutor: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;
}

/// Hands out connections to live queries.
///
/// Failures must be reported as [`LiveQueryError::Connection`](crate::LiveQueryError::Connection)
/// so callers can tell them apart from statement failures.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn QueryExecutor>>;
}
