//! Typed multi-index table.
//!
//! Rows are stored behind `Arc` in a persistent primary `OrdMap`; every
//! secondary index maps a derived key to the set of primary keys carrying
//! it. Tables are plain values: cloning one is O(1) and yields an
//! independent snapshot that shares structure with the original, which is
//! how write transactions get isolation without copying the table.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use im::{OrdMap, OrdSet};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Name of the implicit primary index.
pub const PRIMARY: &str = "id";

/// Compound, ordered index key.
///
/// Keys compare component by component, so every key sharing a leading
/// run of components sits in one contiguous range.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<String>);

impl IndexKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexKey(parts.into_iter().map(Into::into).collect())
    }

    /// Single-component key, stored as given.
    pub fn exact(part: impl Into<String>) -> Self {
        IndexKey(vec![part.into()])
    }

    /// Single-component case-insensitive key.
    pub fn lower(part: &str) -> Self {
        IndexKey(vec![part.to_lowercase()])
    }

    /// Append a component.
    pub fn push(mut self, part: impl Into<String>) -> Self {
        self.0.push(part.into());
        self
    }

    /// Whether `prefix` is a leading run of this key's components.
    pub fn has_prefix(&self, prefix: &IndexKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexKey({})", self.0.join("/"))
    }
}

/// Anything that can be stored in a table.
pub trait Row: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Row for T {}

/// Secondary index definition. `extract` may yield zero keys (row not
/// indexed) or several (multi-valued index).
pub struct IndexSchema<R> {
    pub name: &'static str,
    pub unique: bool,
    pub extract: fn(&R) -> Vec<IndexKey>,
}

/// Table definition, fixed at construction.
pub struct TableSchema<R> {
    pub name: &'static str,
    pub primary: fn(&R) -> IndexKey,
    pub indexes: Vec<IndexSchema<R>>,
}

/// A row-level mutation: `before` is `None` for inserts, `after` is `None`
/// for deletes.
#[derive(Clone, Debug)]
pub struct Change<R> {
    pub before: Option<Arc<R>>,
    pub after: Option<Arc<R>>,
}

impl<R> Change<R> {
    pub fn created(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn deleted(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    pub fn updated(&self) -> bool {
        self.before.is_some() && self.after.is_some()
    }

    /// The row as it is after the change, or as it was if deleted.
    pub fn object(&self) -> Option<&Arc<R>> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// In-memory table with a primary key and fixed secondary indexes.
pub struct Table<R> {
    schema: Arc<TableSchema<R>>,
    rows: OrdMap<IndexKey, Arc<R>>,
    indexes: Vec<OrdMap<IndexKey, OrdSet<IndexKey>>>,
}

impl<R> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            rows: self.rows.clone(),
            indexes: self.indexes.clone(),
        }
    }
}

impl<R: Row> Table<R> {
    pub fn new(schema: Arc<TableSchema<R>>) -> Self {
        let indexes = schema.indexes.iter().map(|_| OrdMap::new()).collect();
        Self {
            schema,
            rows: OrdMap::new(),
            indexes,
        }
    }

    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn primary_key(&self, row: &R) -> IndexKey {
        (self.schema.primary)(row)
    }

    /// Look up by primary key.
    pub fn get(&self, key: &IndexKey) -> Option<&Arc<R>> {
        self.rows.get(key)
    }

    /// All rows in primary key order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<R>> + '_ {
        self.rows.values()
    }

    /// Rows whose primary key starts with `prefix`.
    pub fn prefix<'a>(&'a self, prefix: &'a IndexKey) -> impl Iterator<Item = &'a Arc<R>> + 'a {
        self.rows
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.has_prefix(prefix))
            .map(|(_, v)| v)
    }

    fn index_pos(&self, index: &str) -> Result<usize> {
        self.schema
            .indexes
            .iter()
            .position(|i| i.name == index)
            .ok_or_else(|| StoreError::UnknownIndex {
                table: self.schema.name,
                index: index.to_string(),
            })
    }

    /// Rows carrying exactly `key` in the named index, in primary key order.
    pub fn get_by(&self, index: &str, key: &IndexKey) -> Result<Vec<Arc<R>>> {
        if index == PRIMARY {
            return Ok(self.get(key).cloned().into_iter().collect());
        }
        let pos = self.index_pos(index)?;
        Ok(self.indexes[pos]
            .get(key)
            .map(|pks| pks.iter().filter_map(|pk| self.rows.get(pk).cloned()).collect())
            .unwrap_or_default())
    }

    /// First row carrying `key` in the named index.
    pub fn first_by(&self, index: &str, key: &IndexKey) -> Result<Option<Arc<R>>> {
        if index == PRIMARY {
            return Ok(self.get(key).cloned());
        }
        let pos = self.index_pos(index)?;
        Ok(self.indexes[pos]
            .get(key)
            .and_then(|pks| pks.iter().next())
            .and_then(|pk| self.rows.get(pk).cloned()))
    }

    /// Rows whose key in the named index starts with `prefix`.
    pub fn prefix_by(&self, index: &str, prefix: &IndexKey) -> Result<Vec<Arc<R>>> {
        if index == PRIMARY {
            return Ok(self.prefix(prefix).cloned().collect());
        }
        let pos = self.index_pos(index)?;
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for (_, pks) in self.indexes[pos]
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.has_prefix(prefix))
        {
            for pk in pks.iter() {
                if seen.insert(pk.clone()) {
                    if let Some(row) = self.rows.get(pk) {
                        out.push(Arc::clone(row));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Insert or replace a row, returning the row it replaced.
    ///
    /// Fails without modifying the table if a unique index would end up
    /// with two rows under one key.
    pub fn insert(&mut self, row: R) -> Result<(Option<Arc<R>>, Arc<R>)> {
        let pk = self.primary_key(&row);

        for (pos, index) in self.schema.indexes.iter().enumerate() {
            if !index.unique {
                continue;
            }
            for key in (index.extract)(&row) {
                if let Some(owners) = self.indexes[pos].get(&key) {
                    if owners.iter().any(|owner| *owner != pk) {
                        return Err(StoreError::UniqueViolation {
                            table: self.schema.name,
                            index: index.name,
                        });
                    }
                }
            }
        }

        let previous = self.remove_entry(&pk);
        let row = Arc::new(row);
        for (pos, index) in self.schema.indexes.iter().enumerate() {
            for key in (index.extract)(&row) {
                let mut owners = self.indexes[pos].get(&key).cloned().unwrap_or_default();
                owners.insert(pk.clone());
                self.indexes[pos].insert(key, owners);
            }
        }
        self.rows.insert(pk, Arc::clone(&row));
        Ok((previous, row))
    }

    /// Delete by primary key, returning the removed row.
    pub fn delete(&mut self, key: &IndexKey) -> Option<Arc<R>> {
        self.remove_entry(key)
    }

    fn remove_entry(&mut self, pk: &IndexKey) -> Option<Arc<R>> {
        let row = self.rows.remove(pk)?;
        for (pos, index) in self.schema.indexes.iter().enumerate() {
            for key in (index.extract)(&row) {
                if let Some(set) = self.indexes[pos].get_mut(&key) {
                    set.remove(pk);
                    if set.is_empty() {
                        self.indexes[pos].remove(&key);
                    }
                }
            }
        }
        Some(row)
    }

    /// Every `(index, key)` pair under which `row` is reachable, primary
    /// index included.
    pub fn index_entries(&self, row: &R) -> Vec<(&'static str, IndexKey)> {
        let mut out = vec![(PRIMARY, self.primary_key(row))];
        for index in &self.schema.indexes {
            for key in (index.extract)(row) {
                out.push((index.name, key));
            }
        }
        out
    }
}

impl<R: Row> fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.schema.name)
            .field("rows", &self.rows.len())
            .finish()
    }
}
