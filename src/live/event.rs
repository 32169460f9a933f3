use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use crate::core::{LiveQueryError, Row};

/// Lifecycle of a live query.
///
/// Runs orthogonally to whether a refresh is in flight; see
/// [`LiveQuery::is_refreshing`](super::LiveQuery::is_refreshing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    ResolvingDependencies,
    SubscribingWatchers,
    Ready,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::ResolvingDependencies => "resolving_dependencies",
            Self::SubscribingWatchers => "subscribing_watchers",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One resolved entry of an update, positioned like a
/// [`DiffOp`](crate::diff::DiffOp).
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Added {
        index: usize,
        row: Arc<Row>,
    },
    Removed {
        index: usize,
        row: Arc<Row>,
    },
    Changed {
        index: usize,
        old: Arc<Row>,
        new: Arc<Row>,
    },
}

impl ChangeRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Removed { .. } => "removed",
            Self::Changed { .. } => "changed",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Added { index, .. } | Self::Removed { index, .. } | Self::Changed { index, .. } => {
                *index
            }
        }
    }

    /// Replays an update over a local copy of the result.
    ///
    /// Returns `false` and leaves `rows` partially updated if an index does
    /// not fit, which means `rows` was not in sync with the live query.
    pub fn apply_all(rows: &mut Vec<Arc<Row>>, changes: &[ChangeRecord]) -> bool {
        for change in changes {
            match change {
                Self::Added { index, row } => {
                    if *index > rows.len() {
                        return false;
                    }
                    rows.insert(*index, Arc::clone(row));
                }
                Self::Removed { index, .. } => {
                    if *index >= rows.len() {
                        return false;
                    }
                    rows.remove(*index);
                }
                Self::Changed { index, new, .. } => match rows.get_mut(*index) {
                    Some(slot) => *slot = Arc::clone(new),
                    None => return false,
                },
            }
        }
        true
    }
}

/// Serialized as `[kind, index, row]`, or `[kind, index, old, new]` for changes.
impl Serialize for ChangeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Added { index, row } | Self::Removed { index, row } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(self.kind())?;
                seq.serialize_element(index)?;
                seq.serialize_element(&**row)?;
                seq.end()
            }
            Self::Changed { index, old, new } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(self.kind())?;
                seq.serialize_element(index)?;
                seq.serialize_element(&**old)?;
                seq.serialize_element(&**new)?;
                seq.end()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Every dependent table has live change coverage. Fires once.
    Ready,
    /// Ordered changes of one completed refresh. Never empty.
    Update(Vec<ChangeRecord>),
    /// An operational failure; the live query keeps running.
    Error(LiveQueryError),
}

/// Counters of refresh cycles run by one live query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshStats {
    pub cycles: u64,
    pub updates: u64,
    pub no_ops: u64,
    pub errors: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Receiving end of a live query's events. Yields `None` once it is stopped
/// and every earlier event has been drained.
pub struct LiveEvents {
    rx: mpsc::UnboundedReceiver<LiveEvent>,
}

impl LiveEvents {
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }
}

/// Sending end; closing it severs the subscription for good.
pub(crate) struct Emitter {
    tx: Mutex<Option<mpsc::UnboundedSender<LiveEvent>>>,
}

impl Emitter {
    pub(crate) fn channel() -> (Self, LiveEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            LiveEvents { rx },
        )
    }

    fn tx(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<LiveEvent>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` when closed or nobody is listening anymore.
    pub(crate) fn emit(&self, event: LiveEvent) -> bool {
        match self.tx().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        self.tx().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn row(id: i64) -> Arc<Row> {
        Arc::new(Row::from_pairs([("id", Value::Integer(id))]))
    }

    #[test]
    fn test_change_record_wire_shape() {
        let changes = vec![
            ChangeRecord::Added { index: 0, row: row(1) },
            ChangeRecord::Changed {
                index: 1,
                old: row(2),
                new: row(3),
            },
            ChangeRecord::Removed { index: 2, row: row(4) },
        ];
        assert_eq!(
            serde_json::to_string(&changes).unwrap(),
            r#"[["added",0,{"id":1}],["changed",1,{"id":2},{"id":3}],["removed",2,{"id":4}]]"#
        );
    }

    #[test]
    fn test_apply_all() {
        let mut rows = vec![row(1), row(2), row(3)];
        let ok = ChangeRecord::apply_all(
            &mut rows,
            &[
                ChangeRecord::Removed { index: 0, row: row(1) },
                ChangeRecord::Changed {
                    index: 1,
                    old: row(3),
                    new: row(9),
                },
                ChangeRecord::Added { index: 2, row: row(4) },
            ],
        );
        assert!(ok);
        assert_eq!(rows, vec![row(2), row(9), row(4)]);

        assert!(!ChangeRecord::apply_all(
            &mut rows,
            &[ChangeRecord::Removed { index: 7, row: row(1) }]
        ));
    }

    #[tokio::test]
    async fn test_emitter_close_severs_channel() {
        let (emitter, mut events) = Emitter::channel();
        assert!(emitter.emit(LiveEvent::Ready));
        emitter.close();
        assert!(!emitter.emit(LiveEvent::Ready));

        assert!(matches!(events.recv().await, Some(LiveEvent::Ready)));
        assert!(events.recv().await.is_none());
    }
}
