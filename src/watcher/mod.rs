//! Table-level change watchers and their fan-in.

pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, event};

use crate::core::Result;
use crate::throttle::ThrottleHandle;

pub use registry::{ChannelWatcher, WatcherRegistry};

/// "Something in `table` changed." Carries no row-level detail.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    pub table: Arc<str>,
    pub at: DateTime<Utc>,
}

impl TableChange {
    pub fn now(table: &str) -> Self {
        Self {
            table: Arc::from(table),
            at: Utc::now(),
        }
    }
}

/// Monitors one table for writes.
///
/// Watchers are owned by the surrounding system and shared by every live
/// query reading the same table.
#[async_trait]
pub trait TableWatcher: Send + Sync {
    fn table(&self) -> &str;

    /// Resolves once the watcher is live; immediately if it already is.
    async fn ready(&self) -> Result<()>;

    /// A new receiver of change notifications.
    fn subscribe(&self) -> broadcast::Receiver<TableChange>;
}

/// Obtains (or creates) the watcher of a table.
#[async_trait]
pub trait WatcherFactory: Send + Sync {
    async fn watcher(&self, table: &str) -> Result<Arc<dyn TableWatcher>>;
}

/// Joint view over the watchers of one dependency set.
///
/// Receivers are subscribed as soon as the watchers are obtained, so changes
/// made while waiting for readiness are not lost.
pub struct ChangeWatcherAggregator {
    watchers: Vec<Arc<dyn TableWatcher>>,
    receivers: Vec<broadcast::Receiver<TableChange>>,
}

impl ChangeWatcherAggregator {
    pub async fn attach(factory: &dyn WatcherFactory, tables: &[String]) -> Result<Self> {
        let watchers = try_join_all(tables.iter().map(|table| factory.watcher(table))).await?;
        let receivers = watchers.iter().map(|w| w.subscribe()).collect();
        Ok(Self {
            watchers,
            receivers,
        })
    }

    pub fn tables(&self) -> Vec<&str> {
        self.watchers.iter().map(|w| w.table()).collect()
    }

    /// Resolves once every watcher is ready. Trivially ready when empty.
    pub async fn ready(&self) -> Result<()> {
        try_join_all(self.watchers.iter().map(|w| w.ready())).await?;
        Ok(())
    }

    /// Forwards every change signal into `throttle` until all watchers close.
    pub async fn forward(self, throttle: ThrottleHandle) {
        let loops = self.receivers.into_iter().map(|mut rx| {
            let throttle = throttle.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(_) => throttle.signal(),
                        Err(RecvError::Lagged(skipped)) => {
                            event!(Level::DEBUG, skipped, "change receiver lagged");
                            throttle.signal();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
        join_all(loops).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::RefreshThrottle;
    use std::time::Duration;
    use tokio::time::timeout;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ready_requires_every_watcher() {
        let registry = WatcherRegistry::new();
        let aggregator = ChangeWatcherAggregator::attach(&registry, &tables(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(aggregator.tables(), vec!["a", "b"]);

        registry.mark_ready("a");
        let pending = timeout(Duration::from_millis(20), aggregator.ready()).await;
        assert!(pending.is_err());

        registry.mark_ready("b");
        timeout(Duration::from_millis(20), aggregator.ready())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_dependency_set_is_ready() {
        let registry = WatcherRegistry::new();
        let aggregator = ChangeWatcherAggregator::attach(&registry, &[]).await.unwrap();
        aggregator.ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_signals_throttle() {
        let registry = WatcherRegistry::new().auto_ready(true);
        let aggregator = ChangeWatcherAggregator::attach(&registry, &tables(&["a", "b"]))
            .await
            .unwrap();
        let mut throttle = RefreshThrottle::new(Duration::from_millis(1));
        let forwarding = tokio::spawn(aggregator.forward(throttle.handle()));

        registry.notify_changed("b");
        timeout(Duration::from_secs(1), throttle.acquire()).await.unwrap();

        forwarding.abort();
    }
}
