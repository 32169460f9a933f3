//! Shared row-content cache keyed by fingerprint.
//!
//! Entries are reference counted: every live query holding a fingerprint in
//! its current result owns one reference per occurrence, and an entry is
//! evicted once the last reference is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{Level, event};

use crate::core::{Fingerprint, Row};

/// Storage behind [`RowCacheClient`]. Must be safe for concurrent use.
pub trait RowStore: Send + Sync {
    /// Looks up a row without taking a reference.
    fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>>;

    /// Takes one reference to an existing entry.
    fn retain(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>>;

    /// Inserts `row` unless an entry exists, then takes one reference.
    /// Returns the row now stored under `fingerprint`.
    fn insert(&self, fingerprint: Fingerprint, row: Row) -> Arc<Row>;

    /// Drops one reference, evicting the entry when none remain.
    fn release(&self, fingerprint: &Fingerprint);
}

struct CacheEntry {
    row: Arc<Row>,
    refs: usize,
}

/// In-process [`RowStore`]: a mutex-guarded map with per-key reference counts.
#[derive(Default)]
pub struct SharedRowCache {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl SharedRowCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Number of references currently held on `fingerprint` (0 when absent).
    pub fn ref_count(&self, fingerprint: &Fingerprint) -> usize {
        self.entries().get(fingerprint).map_or(0, |e| e.refs)
    }
}

impl RowStore for SharedRowCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>> {
        self.entries().get(fingerprint).map(|e| Arc::clone(&e.row))
    }

    fn retain(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(fingerprint)?;
        entry.refs += 1;
        Some(Arc::clone(&entry.row))
    }

    fn insert(&self, fingerprint: Fingerprint, row: Row) -> Arc<Row> {
        let mut entries = self.entries();
        let entry = entries.entry(fingerprint).or_insert_with(|| CacheEntry {
            row: Arc::new(row),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.row)
    }

    fn release(&self, fingerprint: &Fingerprint) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(fingerprint);
            }
        }
    }
}

/// One live query's view of the shared store.
///
/// Tracks how many references this query holds per fingerprint so that
/// releases never exceed what was taken, even after a failed cycle.
pub struct RowCacheClient {
    store: Arc<dyn RowStore>,
    held: Mutex<HashMap<Fingerprint, usize>>,
}

impl RowCacheClient {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<Fingerprint, usize>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>> {
        self.store.get(fingerprint)
    }

    /// Takes a reference on a cached row; `None` is a cache miss.
    pub fn retain(&self, fingerprint: &Fingerprint) -> Option<Arc<Row>> {
        let row = self.store.retain(fingerprint)?;
        *self.held().entry(fingerprint.clone()).or_insert(0) += 1;
        Some(row)
    }

    /// Stores a freshly fetched row and takes a reference on it.
    pub fn put(&self, fingerprint: Fingerprint, row: Row) -> Arc<Row> {
        *self.held().entry(fingerprint.clone()).or_insert(0) += 1;
        self.store.insert(fingerprint, row)
    }

    /// Gives back one reference. Returns `false` if none was held.
    pub fn release(&self, fingerprint: &Fingerprint) -> bool {
        {
            let mut held = self.held();
            match held.get_mut(fingerprint) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    held.remove(fingerprint);
                }
                None => return false,
            }
        }
        self.store.release(fingerprint);
        true
    }

    /// Gives back every held reference. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let held: Vec<(Fingerprint, usize)> = self.held().drain().collect();
        let mut released = 0;
        for (fingerprint, count) in held {
            for _ in 0..count {
                self.store.release(&fingerprint);
            }
            released += count;
        }
        if released > 0 {
            event!(Level::DEBUG, released, "released held rows");
        }
        released
    }

    /// References this client holds on `fingerprint`.
    pub fn held_count(&self, fingerprint: &Fingerprint) -> usize {
        self.held().get(fingerprint).copied().unwrap_or(0)
    }

    pub fn held_total(&self) -> usize {
        self.held().values().sum()
    }
}
