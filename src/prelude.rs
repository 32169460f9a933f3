//! Everything needed to run live queries, for glob import.
//!
//! Implementors of custom collaborators additionally want the traits in
//! [`connection`](crate::connection), [`watcher`](crate::watcher) and
//! [`cache`](crate::cache).

pub use crate::{
    ChangeRecord, LiveEvent, LiveEvents, LiveQuery, LiveQueryConfig, LiveQueryContext,
    LiveQueryError, Phase, Query, Row, SharedRowCache, Value, WatcherRegistry,
};
