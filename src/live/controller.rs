use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

use super::event::{ChangeRecord, Emitter, LiveEvent, LiveEvents, Phase, RefreshStats};
use super::refresh::Refresher;
use crate::cache::{RowCacheClient, RowStore};
use crate::connection::{ConnectionProvider, LiveQueryConfig};
use crate::core::{Fingerprint, LiveQueryError, Result, Row};
use crate::dependency::{DependencySet, TableDependencyResolver};
use crate::query::Query;
use crate::throttle::{RefreshThrottle, ThrottleHandle};
use crate::watcher::{ChangeWatcherAggregator, WatcherFactory};

/// Collaborators shared by every live query of a process.
///
/// Cheap to clone; build it once and hand it to [`LiveQuery::start`].
#[derive(Clone)]
pub struct LiveQueryContext {
    provider: Arc<dyn ConnectionProvider>,
    watchers: Arc<dyn WatcherFactory>,
    rows: Arc<dyn RowStore>,
    dependencies: Arc<TableDependencyResolver>,
    config: Arc<LiveQueryConfig>,
}

impl LiveQueryContext {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        watchers: Arc<dyn WatcherFactory>,
        rows: Arc<dyn RowStore>,
    ) -> Result<Self> {
        Self::with_config(provider, watchers, rows, LiveQueryConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ConnectionProvider>,
        watchers: Arc<dyn WatcherFactory>,
        rows: Arc<dyn RowStore>,
        config: LiveQueryConfig,
    ) -> Result<Self> {
        let dependencies = Arc::new(TableDependencyResolver::from_config(&config)?);
        Ok(Self {
            provider,
            watchers,
            rows,
            dependencies,
            config: Arc::new(config),
        })
    }

    /// Shares an existing dependency resolver instead of the one built from the config
    pub fn with_dependency_resolver(mut self, resolver: Arc<TableDependencyResolver>) -> Self {
        self.dependencies = resolver;
        self
    }

    pub fn config(&self) -> &LiveQueryConfig {
        &self.config
    }

    pub fn dependencies(&self) -> &Arc<TableDependencyResolver> {
        &self.dependencies
    }

    pub fn row_store(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }
}

/// State shared between the handle and its background tasks.
struct Shared {
    id: Uuid,
    phase: Mutex<Phase>,
    refreshing: AtomicBool,
    stopped: AtomicBool,
    emitter: Emitter,
    rows: Arc<RowCacheClient>,
    sequence: Arc<Mutex<Vec<Fingerprint>>>,
    stats: Mutex<RefreshStats>,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, RefreshStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn enter(&self, next: Phase) {
        let mut phase = self.phase();
        if *phase != Phase::Stopped {
            *phase = next;
        }
    }

    fn report(&self, err: LiveQueryError) {
        if self.is_stopped() {
            return;
        }
        event!(Level::WARN, query = %self.id, kind = err.kind(), error = %err, "live query error");
        self.emitter.emit(LiveEvent::Error(err));
    }

    /// Gives back every row reference and settles in `Stopped`. Tasks must be gone.
    fn release_held(&self) -> usize {
        let released = self.rows.release_all();
        self.sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.refreshing.store(false, Ordering::Release);
        *self.phase() = Phase::Stopped;
        released
    }

    fn record(&self, outcome: Result<Option<Vec<ChangeRecord>>>) {
        {
            let mut stats = self.stats();
            stats.cycles += 1;
            stats.last_refresh_at = Some(Utc::now());
            match &outcome {
                Ok(None) => stats.no_ops += 1,
                Ok(Some(_)) => stats.updates += 1,
                Err(_) => stats.errors += 1,
            }
        }

        match outcome {
            Ok(None) => event!(Level::DEBUG, query = %self.id, "refresh found no changes"),
            Ok(Some(changes)) => {
                event!(Level::DEBUG, query = %self.id, changes = changes.len(), "refresh produced update");
                if !self.is_stopped() {
                    self.emitter.emit(LiveEvent::Update(changes));
                }
            }
            Err(err) => self.report(err),
        }
    }
}

struct Tasks {
    refresh: JoinHandle<()>,
    watch: JoinHandle<()>,
}

/// Handle of one running live query.
///
/// Dropping the handle without calling [`stop`](Self::stop) aborts its tasks
/// and releases its rows once they have wound down, provided a Tokio runtime
/// is still around to wait for them.
pub struct LiveQuery {
    query: Query,
    shared: Arc<Shared>,
    throttle: ThrottleHandle,
    tasks: Mutex<Option<Tasks>>,
}

impl LiveQuery {
    /// Starts watching `query`. Must be called within a Tokio runtime.
    ///
    /// The first refresh is issued right away, concurrently with dependency
    /// resolution; `Ready` follows once every dependent table is watched.
    pub fn start(query: Query, ctx: &LiveQueryContext) -> (Self, LiveEvents) {
        let (emitter, events) = Emitter::channel();
        let rows = Arc::new(RowCacheClient::new(Arc::clone(&ctx.rows)));
        let sequence = Arc::new(Mutex::new(Vec::new()));

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            phase: Mutex::new(Phase::Connecting),
            refreshing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            emitter,
            rows: Arc::clone(&rows),
            sequence: Arc::clone(&sequence),
            stats: Mutex::new(RefreshStats::default()),
        });

        let throttle = RefreshThrottle::new(ctx.config.throttle_interval);
        let handle = throttle.handle();
        handle.signal();

        let refresher = Refresher {
            query: query.clone(),
            config: Arc::clone(&ctx.config),
            provider: Arc::clone(&ctx.provider),
            rows,
            sequence,
        };

        let refresh = tokio::spawn(drive_refreshes(Arc::clone(&shared), refresher, throttle));
        let watch = tokio::spawn(attach_watchers(
            Arc::clone(&shared),
            query.clone(),
            ctx.clone(),
            handle.clone(),
        ));

        event!(Level::INFO, query = %shared.id, sql = %query.sql(), "live query started");

        let live = Self {
            query,
            shared,
            throttle: handle,
            tasks: Mutex::new(Some(Tasks { refresh, watch })),
        };
        (live, events)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase()
    }

    pub fn is_refreshing(&self) -> bool {
        self.shared.refreshing.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn stats(&self) -> RefreshStats {
        self.shared.stats().clone()
    }

    /// Fingerprints of the current result, in row order.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.shared
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current result materialized from the shared row cache.
    pub fn rows(&self) -> Result<Vec<Arc<Row>>> {
        self.fingerprints()
            .into_iter()
            .map(|fingerprint| {
                self.shared
                    .rows
                    .get(&fingerprint)
                    .ok_or(LiveQueryError::CacheConsistency { fingerprint })
            })
            .collect()
    }

    /// Requests a refresh, subject to the throttle window.
    pub fn refresh(&self) {
        if !self.is_stopped() {
            self.throttle.signal();
        }
    }

    /// Stops the live query for good.
    ///
    /// Any in-flight refresh is cancelled and its outcome discarded, the event
    /// channel closes, and every row reference this query holds is released.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.emitter.close();

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tasks) = tasks {
            tasks.refresh.abort();
            tasks.watch.abort();
            let _ = tasks.refresh.await;
            let _ = tasks.watch.await;
        }

        let released = self.shared.release_held();
        event!(Level::INFO, query = %self.shared.id, released, "live query stopped");
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            return;
        };

        event!(Level::WARN, query = %self.shared.id, "live query dropped without stop()");
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.emitter.close();
        tasks.refresh.abort();
        tasks.watch.abort();

        let shared = Arc::clone(&self.shared);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = tasks.refresh.await;
                    let _ = tasks.watch.await;
                    let released = shared.release_held();
                    event!(Level::DEBUG, query = %shared.id, released, "dropped live query released rows");
                });
            }
            Err(_) if tasks.refresh.is_finished() && tasks.watch.is_finished() => {
                shared.release_held();
            }
            Err(_) => {
                event!(
                    Level::WARN,
                    query = %shared.id,
                    "no runtime to wait for aborted tasks; held rows stay referenced"
                );
            }
        }
    }
}

async fn drive_refreshes(shared: Arc<Shared>, refresher: Refresher, mut throttle: RefreshThrottle) {
    loop {
        throttle.acquire().await;
        if shared.is_stopped() {
            break;
        }

        shared.refreshing.store(true, Ordering::Release);
        let span = info_span!("live.refresh", query = %shared.id);
        let outcome = refresher.run().instrument(span).await;
        shared.refreshing.store(false, Ordering::Release);

        shared.record(outcome);
    }
}

async fn attach_watchers(
    shared: Arc<Shared>,
    query: Query,
    ctx: LiveQueryContext,
    throttle: ThrottleHandle,
) {
    let Some(tables) = resolve_dependencies(&shared, &query, &ctx).await else {
        return;
    };

    shared.enter(Phase::SubscribingWatchers);
    let aggregator = match ChangeWatcherAggregator::attach(ctx.watchers.as_ref(), &tables).await {
        Ok(aggregator) => aggregator,
        Err(err) => {
            shared.report(err);
            return;
        }
    };
    if let Err(err) = aggregator.ready().await {
        shared.report(err);
        return;
    }

    if shared.is_stopped() {
        return;
    }
    shared.enter(Phase::Ready);
    event!(Level::INFO, query = %shared.id, tables = ?aggregator.tables(), "live query ready");
    shared.emitter.emit(LiveEvent::Ready);

    aggregator.forward(throttle).await;
}

/// Resolves the dependency set, retrying only when no connection could be had.
async fn resolve_dependencies(
    shared: &Shared,
    query: &Query,
    ctx: &LiveQueryContext,
) -> Option<DependencySet> {
    loop {
        shared.enter(Phase::ResolvingDependencies);
        match ctx
            .dependencies
            .resolve_with(query, ctx.provider.as_ref())
            .await
        {
            Ok(tables) => return Some(tables),
            Err(LiveQueryError::Connection(msg)) => {
                shared.report(LiveQueryError::Connection(msg));
                tokio::time::sleep(ctx.config.throttle_interval).await;
            }
            Err(err) => {
                shared.report(err);
                return None;
            }
        }
    }
}
