// ============================================================================
// livequery Library
// ============================================================================

//! Continuously up-to-date projections of SQL query results.
//!
//! A [`LiveQuery`] watches the tables its query reads from. Whenever one of
//! them changes it re-lists per-row content fingerprints, diffs them against
//! the previous listing and fetches only the rows it has not seen before,
//! emitting a compact, ordered change log instead of a full result.
//!
//! The database connection pool, the table watchers and the row cache are
//! collaborators supplied through [`LiveQueryContext`]:
//!
//! - [`ConnectionProvider`] / [`QueryExecutor`] wrap the database driver,
//! - [`WatcherFactory`] hands out per-table [`TableWatcher`]s
//!   ([`WatcherRegistry`] is an in-process implementation),
//! - [`RowStore`] holds row contents shared by all live queries
//!   ([`SharedRowCache`] is an in-process implementation).
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use livequery::{LiveEvent, LiveQuery, LiveQueryContext, Query, SharedRowCache, Value, WatcherRegistry};
//!
//! let watchers = Arc::new(WatcherRegistry::new());
//! let ctx = LiveQueryContext::new(pool, watchers.clone(), Arc::new(SharedRowCache::new()))?;
//!
//! let query = Query::with_params("SELECT * FROM users WHERE age > $1", vec![Value::Integer(25)])?;
//! let (live, mut events) = LiveQuery::start(query, &ctx);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LiveEvent::Ready => println!("watching"),
//!         LiveEvent::Update(changes) => println!("{}", serde_json::to_string(&changes)?),
//!         LiveEvent::Error(err) => eprintln!("{}", err),
//!     }
//! }
//! live.stop().await;
//! ```

pub mod cache;
pub mod connection;
pub mod core;
pub mod dependency;
pub mod diff;
pub mod live;
pub mod prelude;
pub mod query;
pub mod result;
pub mod throttle;
pub mod watcher;

pub use cache::{RowCacheClient, RowStore, SharedRowCache};
pub use connection::{ConnectionProvider, LiveQueryConfig, QueryExecutor};
pub use crate::core::{Fingerprint, LiveQueryError, Result, Row, Value};
pub use dependency::{DependencySet, TableDependencyResolver};
pub use diff::DiffOp;
pub use live::{
    ChangeRecord, LiveEvent, LiveEvents, LiveQuery, LiveQueryContext, Phase, RefreshStats,
};
pub use query::Query;
pub use result::QueryResult;
pub use throttle::{RefreshThrottle, ThrottleHandle};
pub use watcher::{
    ChangeWatcherAggregator, ChannelWatcher, TableChange, TableWatcher, WatcherFactory,
    WatcherRegistry,
};
