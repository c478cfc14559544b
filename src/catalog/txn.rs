//! Read and write transactions over a [`Db`] version.

use super::schema::{AnyChange, Db, TableRow};
use crate::error::Result;
use crate::memdb::{Change, IndexKey, Table};
use crate::store::StoreConfig;
use crate::watch::{Notifier, WatchKey, WatchPlanner, WatchSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An isolated write transaction stamped with a write index.
///
/// Works on a private copy of the committed tables and records every
/// row-level change, coalesced per primary key in first-touch order.
/// Dropping it without handing it back to the store discards everything.
pub struct WriteTxn<'a> {
    db: Db,
    idx: u64,
    config: &'a StoreConfig,
    changes: Vec<AnyChange>,
    positions: HashMap<(&'static str, IndexKey), usize>,
    touched: HashSet<WatchKey>,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(db: Db, idx: u64, config: &'a StoreConfig) -> Self {
        Self {
            db,
            idx,
            config,
            changes: Vec::new(),
            positions: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    /// The write index this transaction is stamped with.
    pub fn index(&self) -> u64 {
        self.idx
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        self.config
    }

    pub fn table<R: TableRow>(&self) -> &Table<R> {
        R::table(&self.db)
    }

    pub fn get<R: TableRow>(&self, key: &IndexKey) -> Option<Arc<R>> {
        R::table(&self.db).get(key).cloned()
    }

    /// Insert or replace a row.
    pub fn insert<R: TableRow>(&mut self, row: R) -> Result<Arc<R>> {
        let table = Arc::make_mut(R::table_mut(&mut self.db));
        let (before, after) = table.insert(row)?;
        self.record(before, Some(Arc::clone(&after)));
        Ok(after)
    }

    /// Delete a row by primary key. Deleting a missing row is not a change.
    pub fn delete<R: TableRow>(&mut self, key: &IndexKey) -> Option<Arc<R>> {
        if R::table(&self.db).get(key).is_none() {
            return None;
        }
        let table = Arc::make_mut(R::table_mut(&mut self.db));
        let before = table.delete(key)?;
        self.record(Some(Arc::clone(&before)), None);
        Some(before)
    }

    fn record<R: TableRow>(&mut self, before: Option<Arc<R>>, after: Option<Arc<R>>) {
        let table = R::table(&self.db);
        let pk = match after.as_ref().or(before.as_ref()) {
            Some(row) => table.primary_key(row),
            None => return,
        };

        self.touched.insert(WatchKey::Table(R::TABLE));
        for row in before.iter().chain(after.iter()) {
            for (index, key) in table.index_entries(row) {
                self.touched.insert(WatchKey::index(R::TABLE, index, key));
            }
        }

        match self.positions.get(&(R::TABLE, pk.clone())) {
            Some(&pos) => {
                if let Some(change) = R::change_mut(&mut self.changes[pos]) {
                    change.after = after;
                }
            }
            None => {
                self.positions.insert((R::TABLE, pk), self.changes.len());
                self.changes.push(R::wrap(Change { before, after }));
            }
        }
    }

    /// Every change recorded so far.
    pub fn changes(&self) -> &[AnyChange] {
        &self.changes
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Db, Vec<AnyChange>, HashSet<WatchKey>) {
        (self.db, self.changes, self.touched)
    }
}

/// A read-only view of one committed version.
///
/// Never blocks writers. Watch handles armed through it fire on the
/// first commit after this version that touches their key.
pub struct ReadTxn {
    db: Arc<Db>,
    notifier: Arc<Notifier>,
    planner: WatchPlanner,
}

impl ReadTxn {
    pub(crate) fn new(db: Arc<Db>, notifier: Arc<Notifier>, planner: WatchPlanner) -> Self {
        Self { db, notifier, planner }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn planner(&self) -> WatchPlanner {
        self.planner
    }

    /// Arm `key` into `ws`, if the caller is watching.
    pub(crate) fn arm(&self, ws: &mut Option<&mut WatchSet>, key: WatchKey) {
        if let Some(ws) = ws.as_deref_mut() {
            if !ws.contains(&key) {
                ws.add(self.notifier.watch(key, self.db.generation));
            }
        }
    }

    /// Arm a per-row key, degrading to `fallback` once the set is full.
    pub(crate) fn arm_row(&self, ws: &mut Option<&mut WatchSet>, key: WatchKey, fallback: WatchKey) {
        if let Some(set) = ws.as_deref_mut() {
            let chosen = self.planner.row_key(set, key, fallback);
            self.arm(ws, chosen);
        }
    }
}
