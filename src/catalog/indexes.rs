//! Index-table bookkeeping: per-table, per-service-name and per-kind
//! counters plus the service extinction index.

use super::schema::{index_key, Db, TableRow, TABLE_CHECKS, TABLE_NODES, TABLE_SERVICES};
use super::txn::WriteTxn;
use crate::error::Result;
use crate::memdb::PRIMARY;
use crate::types::{IndexEntry, ServiceKind};
use crate::watch::WatchKey;

/// Index entry recording when the last instance of some service vanished.
pub const SERVICE_LAST_EXTINCTION: &str = "service_last_extinction";

const SERVICE_INDEX_PREFIX: &str = "service.";

/// Name of the narrow index entry for one service.
pub fn service_index_name(service: &str) -> String {
    format!("{}{}", SERVICE_INDEX_PREFIX, service)
}

/// Name of the index entry for one service kind.
pub fn service_kind_index_name(kind: ServiceKind) -> String {
    format!("service_kind.{}", kind.as_str())
}

/// The service name behind a `service.<name>` index entry key.
pub fn service_from_index_name(key: &str) -> Option<&str> {
    key.strip_prefix(SERVICE_INDEX_PREFIX)
}

/// Watch key for a single index entry.
pub(crate) fn index_entry_watch(name: &str) -> WatchKey {
    WatchKey::index(IndexEntry::TABLE, PRIMARY, index_key(name))
}

impl Db {
    /// Value of one index entry, if present.
    pub fn index_value(&self, name: &str) -> Option<u64> {
        self.index.get(&index_key(name)).map(|e| e.value)
    }

    /// Highest value among the named entries, zero if none exist.
    pub fn max_index(&self, names: &[&str]) -> u64 {
        names
            .iter()
            .filter_map(|n| self.index_value(n))
            .max()
            .unwrap_or(0)
    }

    /// Logical index of the whole catalog, checks optional.
    pub fn catalog_max_index(&self, checks: bool) -> u64 {
        if checks {
            self.max_index(&[TABLE_NODES, TABLE_SERVICES, TABLE_CHECKS])
        } else {
            self.max_index(&[TABLE_NODES, TABLE_SERVICES])
        }
    }
}

impl WriteTxn<'_> {
    /// Raise an index entry to this transaction's index. Never lowers it.
    pub(crate) fn index_update_max(&mut self, name: &str) -> Result<()> {
        let idx = self.index();
        let key = match self.get::<IndexEntry>(&index_key(name)) {
            Some(existing) if existing.value >= idx => return Ok(()),
            Some(existing) => existing.key.clone(),
            None => name.to_string(),
        };
        self.insert(IndexEntry { key, value: idx })?;
        Ok(())
    }

    /// Set an index entry outright.
    pub(crate) fn index_set(&mut self, name: &str, value: u64) -> Result<()> {
        self.insert(IndexEntry {
            key: name.to_string(),
            value,
        })?;
        Ok(())
    }

    pub(crate) fn index_delete(&mut self, name: &str) -> Option<u64> {
        self.delete::<IndexEntry>(&index_key(name)).map(|e| e.value)
    }

    pub(crate) fn update_nodes_index(&mut self) -> Result<()> {
        self.index_update_max(TABLE_NODES)
    }

    pub(crate) fn update_services_index(&mut self) -> Result<()> {
        self.index_update_max(TABLE_SERVICES)
    }

    pub(crate) fn update_service_index(&mut self, service: &str) -> Result<()> {
        self.index_update_max(&service_index_name(service))
    }

    pub(crate) fn update_service_kind_index(&mut self, kind: ServiceKind) -> Result<()> {
        self.index_update_max(&service_kind_index_name(kind))
    }

    pub(crate) fn update_checks_index(&mut self) -> Result<()> {
        let idx = self.index();
        self.index_set(TABLE_CHECKS, idx)
    }

    pub(crate) fn update_service_extinction_index(&mut self) -> Result<()> {
        let idx = self.index();
        self.index_set(SERVICE_LAST_EXTINCTION, idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    #[test]
    fn test_index_update_max_never_lowers() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 10, &config);
        tx.update_service_index("web").unwrap();
        let (db, _, _) = tx.into_parts();
        assert_eq!(db.index_value("service.web"), Some(10));

        let mut tx = WriteTxn::new(db, 5, &config);
        tx.update_service_index("web").unwrap();
        assert!(!tx.has_changes());
        let (db, _, _) = tx.into_parts();
        assert_eq!(db.index_value("service.web"), Some(10));
    }

    #[test]
    fn test_service_index_preserves_first_case() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 1, &config);
        tx.update_service_index("Web").unwrap();
        let (db, _, _) = tx.into_parts();

        let mut tx = WriteTxn::new(db, 2, &config);
        tx.update_service_index("web").unwrap();
        let (db, _, _) = tx.into_parts();

        let entry = db.index().get(&index_key("service.web")).unwrap();
        assert_eq!(entry.key, "service.Web");
        assert_eq!(entry.value, 2);
        assert_eq!(service_from_index_name(&entry.key), Some("Web"));
    }

    #[test]
    fn test_catalog_max_index() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 3, &config);
        tx.update_nodes_index().unwrap();
        tx.update_checks_index().unwrap();
        let (db, _, _) = tx.into_parts();

        assert_eq!(db.catalog_max_index(false), 3);
        assert_eq!(db.max_index(&["services"]), 0);
        assert_eq!(db.catalog_max_index(true), 3);
    }
}
