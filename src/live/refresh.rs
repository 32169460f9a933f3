//! One refresh cycle: list fingerprints, diff, fill cache gaps, resolve rows.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{Level, event};

use super::event::ChangeRecord;
use crate::cache::RowCacheClient;
use crate::connection::{ConnectionProvider, LiveQueryConfig, QueryExecutor};
use crate::core::{Fingerprint, LiveQueryError, Result, Row, Value};
use crate::diff::{DiffOp, diff};
use crate::query::{Query, sql};

/// Everything a refresh touches. Owned by the refresh task of one live query,
/// which is what keeps cycles of that query strictly serialized.
pub(crate) struct Refresher {
    pub(crate) query: Query,
    pub(crate) config: Arc<LiveQueryConfig>,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) rows: Arc<RowCacheClient>,
    pub(crate) sequence: Arc<Mutex<Vec<Fingerprint>>>,
}

/// Rows gathered for one cycle's operations.
#[derive(Default)]
struct Resolution {
    rows: HashMap<Fingerprint, Arc<Row>>,
    /// New-side misses and how many references each still needs.
    unowned: HashMap<Fingerprint, usize>,
    fetch: BTreeSet<Fingerprint>,
}

impl Refresher {
    fn sequence(&self) -> MutexGuard<'_, Vec<Fingerprint>> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one cycle. `Ok(None)` means the result did not change.
    ///
    /// The fresh fingerprint sequence is committed as soon as it differs, even
    /// if a later step fails; superseded rows are released in either case.
    pub(crate) async fn run(&self) -> Result<Option<Vec<ChangeRecord>>> {
        let mut conn = self.provider.acquire().await?;

        let fresh = self.list_fingerprints(conn.as_mut()).await?;
        let ops = diff(&self.sequence(), &fresh);
        if ops.is_empty() {
            return Ok(None);
        }
        *self.sequence() = fresh;

        let mut resolution = Resolution::default();
        for op in &ops {
            match op {
                DiffOp::Added { fingerprint, .. } => self.take_new(fingerprint, &mut resolution),
                DiffOp::Removed { fingerprint, .. } => self.find_old(fingerprint, &mut resolution),
                DiffOp::Changed { old, new, .. } => {
                    self.find_old(old, &mut resolution);
                    self.take_new(new, &mut resolution);
                }
            }
        }

        let fetched = if resolution.fetch.is_empty() {
            Ok(())
        } else {
            self.fetch_missing(conn.as_mut(), &mut resolution).await
        };
        drop(conn);

        let records = fetched.and_then(|()| resolve_records(&ops, &resolution.rows));

        for op in &ops {
            match op {
                DiffOp::Removed { fingerprint, .. } => {
                    self.rows.release(fingerprint);
                }
                DiffOp::Changed { old, .. } => {
                    self.rows.release(old);
                }
                DiffOp::Added { .. } => {}
            }
        }

        records.map(Some)
    }

    async fn list_fingerprints(&self, conn: &mut dyn QueryExecutor) -> Result<Vec<Fingerprint>> {
        let listing = sql::fingerprint_listing(&self.config, self.query.sql());
        let result = conn.query(&listing, self.query.params()).await?;
        Ok(result
            .text_column(&self.config.hash_column)?
            .into_iter()
            .map(Fingerprint::from)
            .collect())
    }

    /// Takes a reference for a fingerprint entering the result.
    fn take_new(&self, fingerprint: &Fingerprint, resolution: &mut Resolution) {
        if let Some(count) = resolution.unowned.get_mut(fingerprint) {
            *count += 1;
            return;
        }
        match self.rows.retain(fingerprint) {
            Some(row) => {
                resolution.rows.insert(fingerprint.clone(), row);
            }
            None => {
                resolution.unowned.insert(fingerprint.clone(), 1);
                resolution.fetch.insert(fingerprint.clone());
            }
        }
    }

    /// Looks up a fingerprint leaving the result; it should still be cached.
    fn find_old(&self, fingerprint: &Fingerprint, resolution: &mut Resolution) {
        if resolution.rows.contains_key(fingerprint) || resolution.fetch.contains(fingerprint) {
            return;
        }
        match self.rows.get(fingerprint) {
            Some(row) => {
                resolution.rows.insert(fingerprint.clone(), row);
            }
            None => {
                resolution.fetch.insert(fingerprint.clone());
            }
        }
    }

    async fn fetch_missing(
        &self,
        conn: &mut dyn QueryExecutor,
        resolution: &mut Resolution,
    ) -> Result<()> {
        let mut params: Vec<Value> = self.query.params().to_vec();
        let first_param = params.len() + 1;
        params.extend(resolution.fetch.iter().map(|fp| Value::Text(fp.to_string())));

        let fetch_sql = sql::targeted_fetch(
            &self.config,
            self.query.sql(),
            first_param,
            resolution.fetch.len(),
        );
        let fetched = conn
            .query(&fetch_sql, &params)
            .await?
            .split_text_column(&self.config.hash_column)?;

        event!(
            Level::DEBUG,
            requested = resolution.fetch.len(),
            returned = fetched.len(),
            "fetched missing rows"
        );

        for (hash, row) in fetched {
            let fingerprint = Fingerprint::from(hash);
            if resolution.rows.contains_key(&fingerprint) || !resolution.fetch.contains(&fingerprint) {
                continue;
            }
            let stored = match resolution.unowned.remove(&fingerprint) {
                Some(count) => {
                    let stored = self.rows.put(fingerprint.clone(), row);
                    for _ in 1..count {
                        self.rows.retain(&fingerprint);
                    }
                    stored
                }
                // Leaving the result: needed for this cycle only.
                None => Arc::new(row),
            };
            resolution.rows.insert(fingerprint, stored);
        }
        Ok(())
    }
}

fn resolve_records(
    ops: &[DiffOp],
    rows: &HashMap<Fingerprint, Arc<Row>>,
) -> Result<Vec<ChangeRecord>> {
    let lookup = |fingerprint: &Fingerprint| {
        rows.get(fingerprint)
            .cloned()
            .ok_or_else(|| LiveQueryError::CacheConsistency {
                fingerprint: fingerprint.clone(),
            })
    };

    ops.iter()
        .map(|op| {
            Ok(match op {
                DiffOp::Added { index, fingerprint } => ChangeRecord::Added {
                    index: *index,
                    row: lookup(fingerprint)?,
                },
                DiffOp::Removed { index, fingerprint } => ChangeRecord::Removed {
                    index: *index,
                    row: lookup(fingerprint)?,
                },
                DiffOp::Changed { index, old, new } => ChangeRecord::Changed {
                    index: *index,
                    old: lookup(old)?,
                    new: lookup(new)?,
                },
            })
        })
        .collect()
}
