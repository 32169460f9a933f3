//! Discovery and memoization of the tables a query reads from.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

use crate::connection::{ConnectionProvider, LiveQueryConfig, QueryExecutor};
use crate::core::{LiveQueryError, Result, Value};
use crate::query::{Query, sql};

/// Ordered, de-duplicated table names a query depends on.
pub type DependencySet = Arc<[String]>;

/// Resolves and memoizes query dependencies.
///
/// One resolver is meant to be shared by every live query in the process.
/// Entries are keyed by the normalized query text, so queries that differ only
/// in parameter values share a single lookup. The cache is LRU-bounded.
pub struct TableDependencyResolver {
    view_prefix: String,
    cache: Mutex<LruCache<Uuid, DependencySet>>,
}

impl TableDependencyResolver {
    pub fn new(capacity: NonZeroUsize, view_prefix: &str) -> Self {
        Self {
            view_prefix: view_prefix.to_string(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(config: &LiveQueryConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.dependency_cache_capacity).ok_or_else(|| {
            LiveQueryError::Config("dependency_cache_capacity must be > 0".to_string())
        })?;
        Ok(Self::new(capacity, &config.view_prefix))
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<Uuid, DependencySet>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Memoized dependencies of `query`, if already resolved.
    pub fn cached(&self, query: &Query) -> Result<Option<DependencySet>> {
        let key = query.cache_key()?;
        Ok(self.cache().get(&key).cloned())
    }

    /// Resolves through `provider`, acquiring a connection only on a cache miss.
    pub async fn resolve_with(
        &self,
        query: &Query,
        provider: &dyn ConnectionProvider,
    ) -> Result<DependencySet> {
        if let Some(tables) = self.cached(query)? {
            event!(Level::DEBUG, tables = tables.len(), "dependency cache hit");
            return Ok(tables);
        }
        let mut executor = provider.acquire().await?;
        self.resolve(query, executor.as_mut()).await
    }

    /// Resolves on the given connection, consulting the cache first.
    pub async fn resolve(
        &self,
        query: &Query,
        executor: &mut dyn QueryExecutor,
    ) -> Result<DependencySet> {
        let key = query.cache_key()?;
        if let Some(tables) = self.cache().get(&key).cloned() {
            return Ok(tables);
        }

        let span = info_span!("live.dependencies", key = %key);
        let tables = self
            .introspect(query, executor)
            .instrument(span)
            .await?;

        self.cache().put(key, Arc::clone(&tables));
        Ok(tables)
    }

    async fn introspect(
        &self,
        query: &Query,
        executor: &mut dyn QueryExecutor,
    ) -> Result<DependencySet> {
        let normalized = query.normalized()?;
        let view = format!("{}{}", self.view_prefix, Uuid::new_v4().simple());

        executor
            .query(&sql::create_dependency_view(&view, &normalized), &[])
            .await
            .map_err(into_resolution_error)?;

        let listed = executor
            .query(sql::view_dependencies(), &[Value::Text(view.clone())])
            .await;

        if let Err(err) = executor.query(&sql::drop_dependency_view(&view), &[]).await {
            event!(Level::WARN, view = %view, error = %err, "failed to drop dependency view");
        }

        let listed = listed.map_err(into_resolution_error)?;
        let tables: BTreeSet<String> = listed
            .text_column("table_name")
            .map_err(into_resolution_error)?
            .into_iter()
            .collect();

        event!(Level::DEBUG, tables = ?tables, "resolved query dependencies");
        Ok(tables.into_iter().collect())
    }

    /// Drops the memoized entry of `query`. Returns whether one existed.
    pub fn invalidate(&self, query: &Query) -> Result<bool> {
        let key = query.cache_key()?;
        Ok(self.cache().pop(&key).is_some())
    }

    pub fn clear(&self) {
        self.cache().clear();
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }
}

fn into_resolution_error(err: LiveQueryError) -> LiveQueryError {
    match err {
        LiveQueryError::Query(msg) | LiveQueryError::Parse(msg) => {
            LiveQueryError::DependencyResolution(msg)
        }
        other => other,
    }
}
