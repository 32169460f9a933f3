use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{Level, event};

use super::{TableChange, TableWatcher, WatcherFactory};
use crate::core::{LiveQueryError, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Watcher driven by explicit calls, for embedders that detect writes
/// themselves (and for tests).
pub struct ChannelWatcher {
    table: String,
    ready: watch::Sender<bool>,
    changes: broadcast::Sender<TableChange>,
}

impl ChannelWatcher {
    pub fn new(table: &str) -> Self {
        let (ready, _) = watch::channel(false);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            table: table.to_string(),
            ready,
            changes,
        }
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Broadcasts a change. Returns how many subscribers received it.
    pub fn notify_changed(&self) -> usize {
        self.changes
            .send(TableChange::now(&self.table))
            .unwrap_or(0)
    }
}

#[async_trait]
impl TableWatcher for ChannelWatcher {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| LiveQueryError::Watcher(format!("watcher for '{}' closed", self.table)))
    }

    fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }
}

/// In-process [`WatcherFactory`] keeping one shared [`ChannelWatcher`] per table.
#[derive(Default)]
pub struct WatcherRegistry {
    auto_ready: bool,
    watchers: Mutex<HashMap<String, Arc<ChannelWatcher>>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark new watchers ready as soon as they are created
    pub fn auto_ready(mut self, enabled: bool) -> Self {
        self.auto_ready = enabled;
        self
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelWatcher>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the watcher of `table`, creating it on first use.
    pub fn watcher_for(&self, table: &str) -> Arc<ChannelWatcher> {
        let mut watchers = self.watchers();
        let watcher = watchers.entry(table.to_string()).or_insert_with(|| {
            event!(Level::DEBUG, table = %table, "creating table watcher");
            let watcher = ChannelWatcher::new(table);
            if self.auto_ready {
                watcher.mark_ready();
            }
            Arc::new(watcher)
        });
        Arc::clone(watcher)
    }

    pub fn mark_ready(&self, table: &str) {
        self.watcher_for(table).mark_ready();
    }

    /// Reports a write to `table`. Returns how many subscribers were reached.
    pub fn notify_changed(&self, table: &str) -> usize {
        match self.watchers().get(table) {
            Some(watcher) => watcher.notify_changed(),
            None => 0,
        }
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.watchers().keys().cloned().collect();
        tables.sort();
        tables
    }

    pub fn len(&self) -> usize {
        self.watchers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers().is_empty()
    }
}

#[async_trait]
impl WatcherFactory for WatcherRegistry {
    async fn watcher(&self, table: &str) -> Result<Arc<dyn TableWatcher>> {
        let watcher: Arc<dyn TableWatcher> = self.watcher_for(table);
        Ok(watcher)
    }
}
