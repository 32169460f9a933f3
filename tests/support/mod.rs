//! Scripted in-memory backend for live query tests.
//!
//! Understands exactly the statements a live query issues: dependency view
//! creation/introspection/drop, fingerprint listing and targeted fetch.
//! Registered queries are evaluated by plain closures over in-memory tables,
//! and a row's fingerprint is its JSON encoding.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use livequery::{
    ChangeRecord, ConnectionProvider, LiveEvent, LiveEvents, LiveQuery, LiveQueryConfig,
    LiveQueryContext, LiveQueryError, Phase, QueryExecutor, QueryResult, Result, Row,
    SharedRowCache, Value, WatcherRegistry,
};
use tokio::time::{sleep, timeout};

pub type Tables = HashMap<String, Vec<Row>>;
type Eval = Arc<dyn Fn(&Tables, &[Value]) -> Vec<Row> + Send + Sync>;

struct Registered {
    sql: String,
    normalized: String,
    tables: Vec<String>,
    eval: Eval,
}

#[derive(Default)]
struct DbState {
    tables: Tables,
    queries: Vec<Registered>,
    views: HashMap<String, Vec<String>>,
    log: Vec<String>,
    failing_connects: usize,
    drop_fetched_rows: bool,
    fail_listing: bool,
    query_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<DbState>,
}

pub fn fingerprint_of(row: &Row) -> String {
    serde_json::to_string(row).unwrap()
}

pub fn row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::Integer(id)), ("name", Value::from(name))])
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `sql` executable. `normalized` is its text with placeholders
    /// replaced, as sent for dependency discovery.
    pub fn register<F>(&self, sql: &str, normalized: &str, tables: &[&str], eval: F)
    where
        F: Fn(&Tables, &[Value]) -> Vec<Row> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().queries.push(Registered {
            sql: sql.to_string(),
            normalized: normalized.to_string(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            eval: Arc::new(eval),
        });
    }

    pub fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut Vec<Row>) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.tables.entry(table.to_string()).or_default())
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().failing_connects = count;
    }

    pub fn drop_fetched_rows(&self, enabled: bool) {
        self.state.lock().unwrap().drop_fetched_rows = enabled;
    }

    /// Makes fingerprint listings fail as if the query were broken.
    pub fn fail_listing(&self, enabled: bool) {
        self.state.lock().unwrap().fail_listing = enabled;
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().query_delay = delay;
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count_statements(&self, prefix: &str) -> usize {
        self.log().iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub fn fetch_count(&self) -> usize {
        self.log().iter().filter(|s| s.contains(" IN (")).count()
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());

        if let Some(rest) = sql.strip_prefix("CREATE OR REPLACE TEMP VIEW \"") {
            let (view, body) = rest
                .split_once("\" AS ")
                .ok_or_else(|| LiveQueryError::Query("malformed view".into()))?;
            let tables = state
                .queries
                .iter()
                .find(|q| q.normalized == body)
                .map(|q| q.tables.clone())
                .ok_or_else(|| LiveQueryError::Query(format!("cannot create view over: {}", body)))?;
            state.views.insert(view.to_string(), tables);
            return Ok(QueryResult::empty());
        }

        if sql.contains("information_schema.view_column_usage") {
            let view = params.first().and_then(Value::as_str).unwrap_or_default();
            let rows: Vec<Vec<Value>> = state
                .views
                .get(view)
                .map(|tables| tables.iter().map(|t| vec![Value::from(t.as_str())]).collect())
                .unwrap_or_default();
            return Ok(QueryResult::new(vec!["table_name".into()], rows));
        }

        if let Some(rest) = sql.strip_prefix("DROP VIEW IF EXISTS \"") {
            state.views.remove(rest.trim_end_matches('"'));
            return Ok(QueryResult::empty());
        }

        let rest = sql
            .strip_prefix("WITH \"live_query\" AS (")
            .ok_or_else(|| LiveQueryError::Query(format!("unsupported statement: {}", sql)))?;
        let registered = state
            .queries
            .iter()
            .filter(|q| rest.starts_with(&format!("{})", q.sql)))
            .max_by_key(|q| q.sql.len())
            .ok_or_else(|| LiveQueryError::Query(format!("unknown query: {}", sql)))?;

        match sql.rfind(" IN (") {
            None if state.fail_listing => Err(LiveQueryError::Query(
                "column \"name\" does not exist".into(),
            )),
            None => {
                let rows = (registered.eval)(&state.tables, params);
                Ok(QueryResult::new(
                    vec!["_live_hash".into()],
                    rows.iter()
                        .map(|r| vec![Value::Text(fingerprint_of(r))])
                        .collect(),
                ))
            }
            Some(pos) => {
                let wanted = sql[pos..].matches('$').count();
                let (user_params, hashes) = params.split_at(params.len() - wanted);
                let rows = (registered.eval)(&state.tables, user_params);
                let mut columns: Vec<String> = rows
                    .first()
                    .map(|r| r.columns().to_vec())
                    .unwrap_or_default();
                columns.push("_live_hash".into());

                if state.drop_fetched_rows {
                    return Ok(QueryResult::new(columns, Vec::new()));
                }
                let selected = rows
                    .iter()
                    .filter_map(|r| {
                        let hash = fingerprint_of(r);
                        hashes
                            .iter()
                            .any(|h| h.as_str() == Some(hash.as_str()))
                            .then(|| {
                                let mut values = r.values().to_vec();
                                values.push(Value::Text(hash));
                                values
                            })
                    })
                    .collect();
                Ok(QueryResult::new(columns, selected))
            }
        }
    }
}

pub struct MemoryProvider {
    db: Arc<MemoryDb>,
}

impl MemoryProvider {
    pub fn new(db: Arc<MemoryDb>) -> Arc<Self> {
        Arc::new(Self { db })
    }
}

struct MemoryConnection {
    db: Arc<MemoryDb>,
}

#[async_trait]
impl QueryExecutor for MemoryConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let delay = self.db.state.lock().unwrap().query_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.db.execute(sql, params)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn acquire(&self) -> Result<Box<dyn QueryExecutor>> {
        {
            let mut state = self.db.state.lock().unwrap();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(LiveQueryError::Connection("connection refused".into()));
            }
        }
        Ok(Box::new(MemoryConnection {
            db: Arc::clone(&self.db),
        }))
    }
}

/// Database, watchers and cache wired into one context.
pub struct Harness {
    pub db: Arc<MemoryDb>,
    pub watchers: Arc<WatcherRegistry>,
    pub cache: Arc<SharedRowCache>,
    pub ctx: LiveQueryContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LiveQueryConfig::new().throttle_interval(Duration::from_millis(100)))
    }

    pub fn with_config(config: LiveQueryConfig) -> Self {
        Self::build(config, true)
    }

    /// Watchers only become ready through `watchers.mark_ready`.
    pub fn manual_ready() -> Self {
        Self::build(
            LiveQueryConfig::new().throttle_interval(Duration::from_millis(100)),
            false,
        )
    }

    fn build(config: LiveQueryConfig, auto_ready: bool) -> Self {
        let db = MemoryDb::new();
        let watchers = Arc::new(WatcherRegistry::new().auto_ready(auto_ready));
        let cache = Arc::new(SharedRowCache::new());
        let ctx = LiveQueryContext::with_config(
            MemoryProvider::new(Arc::clone(&db)),
            watchers.clone(),
            cache.clone(),
            config,
        )
        .unwrap();
        Self {
            db,
            watchers,
            cache,
            ctx,
        }
    }

    /// Registers `SELECT * FROM users ORDER BY id` and seeds the table.
    pub fn users(&self, seed: Vec<Row>) -> &'static str {
        const SQL: &str = "SELECT * FROM users ORDER BY id";
        self.db.register(SQL, SQL, &["users"], |tables, _| {
            let mut rows = tables.get("users").cloned().unwrap_or_default();
            rows.sort_by_key(|r| r.get("id").and_then(Value::as_i64));
            rows
        });
        self.db.with_table("users", |rows| *rows = seed);
        SQL
    }
}

pub async fn next_event(events: &mut LiveEvents) -> Option<LiveEvent> {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for a live query event")
}

/// Next update, skipping `Ready`. Panics on errors.
pub async fn next_update(events: &mut LiveEvents) -> Vec<ChangeRecord> {
    loop {
        match next_event(events).await {
            Some(LiveEvent::Update(changes)) => return changes,
            Some(LiveEvent::Ready) => continue,
            Some(LiveEvent::Error(err)) => panic!("unexpected error event: {}", err),
            None => panic!("event channel closed"),
        }
    }
}

/// Next event other than `Ready`; `None` once the channel closes.
pub async fn next_non_ready(events: &mut LiveEvents) -> Option<LiveEvent> {
    loop {
        match next_event(events).await {
            Some(LiveEvent::Ready) => continue,
            other => return other,
        }
    }
}

/// Asserts that nothing but `Ready` arrives within `window`.
pub async fn assert_quiet(events: &mut LiveEvents, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => return,
            Ok(Some(LiveEvent::Ready)) => continue,
            Ok(other) => panic!("expected no events, got {:?}", other),
        }
    }
}

pub async fn wait_for_phase(live: &LiveQuery, phase: Phase) {
    for _ in 0..10_000 {
        if live.phase() == phase {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("live query never reached {}, stuck in {}", phase, live.phase());
}
