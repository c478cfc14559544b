//! Service instance upsert and delete.

use super::indexes::service_index_name;
use super::nodes::cas_matches;
use super::schema::{node_key, service_key, INDEX_NODE_SERVICE, INDEX_SERVICE};
use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::memdb::IndexKey;
use crate::types::{validate_metadata, HealthCheck, ServiceInstance};
use std::sync::Arc;
use tracing::debug;

impl WriteTxn<'_> {
    pub(crate) fn service_on_node(&self, node: &str, service_id: &str) -> Option<Arc<ServiceInstance>> {
        self.get::<ServiceInstance>(&service_key(node, service_id))
    }

    fn service_name_exists(&self, service: &str) -> Result<bool> {
        Ok(self
            .table::<ServiceInstance>()
            .first_by(INDEX_SERVICE, &IndexKey::lower(service))?
            .is_some())
    }

    /// Upsert a service instance on `node`.
    ///
    /// A write logically equal to the stored instance is dropped. Every
    /// real write bumps the services table index along with the
    /// instance's name and kind indexes.
    pub fn ensure_service(&mut self, node: &str, svc: ServiceInstance) -> Result<()> {
        if self.config().validate_metadata {
            validate_metadata(&svc.meta, false).map_err(|e| {
                StoreError::Validation(format!("invalid service meta for node {} and service {}: {}", node, svc.id, e))
            })?;
        }

        let owner = self.node_by_name(node).ok_or(StoreError::MissingNode)?;
        let existing = self.service_on_node(node, &svc.id);

        let mut entry = svc;
        entry.node = owner.name.clone();

        let idx = self.index();
        match &existing {
            Some(current) => {
                entry.create_index = current.create_index;
                entry.modify_index = current.modify_index;
                if entry.is_same_service(current) {
                    return Ok(());
                }
                entry.modify_index = idx;
            }
            None => {
                entry.create_index = idx;
                entry.modify_index = idx;
            }
        }

        let inserted = self.insert_service(entry)?;

        if let Some(previous) = existing {
            if previous.kind != inserted.kind {
                self.update_service_kind_index(previous.kind)?;
            }
            if !previous.service.eq_ignore_ascii_case(&inserted.service) {
                debug!(node = %inserted.node, id = %inserted.id, from = %previous.service, to = %inserted.service, "service renamed");
                self.retire_service_name(&previous.service)?;
            }
            if previous.service != inserted.service || previous.tags != inserted.tags {
                self.refresh_service_checks(&inserted)?;
            }
        }
        Ok(())
    }

    /// Create-or-update a service under compare-and-swap on its modify index.
    pub fn ensure_service_cas(&mut self, node: &str, svc: ServiceInstance) -> Result<bool> {
        let stored = self.service_on_node(node, &svc.id).map(|s| s.modify_index);
        if !cas_matches(svc.modify_index, stored) {
            return Ok(false);
        }
        self.ensure_service(node, svc)?;
        Ok(true)
    }

    fn insert_service(&mut self, entry: ServiceInstance) -> Result<Arc<ServiceInstance>> {
        let inserted = self.insert(entry)?;
        self.update_services_index()?;
        self.update_service_index(&inserted.service)?;
        self.update_service_kind_index(inserted.kind)?;
        Ok(inserted)
    }

    /// Bump a service name's index, or garbage-collect it and stamp the
    /// extinction index if no instance carries the name any more.
    fn retire_service_name(&mut self, service: &str) -> Result<()> {
        if self.service_name_exists(service)? {
            self.update_service_index(service)
        } else {
            self.index_delete(&service_index_name(service));
            self.update_service_extinction_index()
        }
    }

    /// Re-copy a service's name and tags into its checks. Rewritten checks
    /// take the write's index, as does the checks table.
    fn refresh_service_checks(&mut self, svc: &ServiceInstance) -> Result<()> {
        let checks = self
            .table::<HealthCheck>()
            .get_by(INDEX_NODE_SERVICE, &node_key(&svc.node).push(svc.id.clone()))?;
        let idx = self.index();
        let mut refreshed = 0;
        for check in checks {
            if check.service_name == svc.service && check.service_tags == svc.tags {
                continue;
            }
            let mut check = (*check).clone();
            check.service_name = svc.service.clone();
            check.service_tags = svc.tags.clone();
            check.modify_index = idx;
            self.insert(check)?;
            refreshed += 1;
        }
        if refreshed > 0 {
            self.update_checks_index()?;
        }
        Ok(())
    }

    /// Delete a service instance and its checks.
    pub fn delete_service(&mut self, node: &str, service_id: &str) -> Result<()> {
        let svc = match self.service_on_node(node, service_id) {
            Some(svc) => svc,
            None => return Ok(()),
        };

        let checks = self
            .table::<HealthCheck>()
            .get_by(INDEX_NODE_SERVICE, &node_key(node).push(service_id))?;
        for check in &checks {
            self.delete_check(node, &check.check_id)?;
        }
        self.update_checks_index()?;

        self.delete::<ServiceInstance>(&service_key(node, service_id));
        self.update_services_index()?;
        self.update_service_kind_index(svc.kind)?;
        // Node listings embed their services.
        self.update_nodes_index()?;

        self.retire_service_name(&svc.service)?;

        debug!(node = %svc.node, id = %svc.id, service = %svc.service, checks = checks.len(), "deleted service");
        Ok(())
    }

    /// Delete a service only if its modify index equals `cidx`.
    pub fn delete_service_cas(&mut self, node: &str, service_id: &str, cidx: u64) -> Result<bool> {
        match self.service_on_node(node, service_id) {
            Some(svc) if svc.modify_index == cidx => {
                self.delete_service(node, service_id)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Db;
    use crate::store::StoreConfig;
    use crate::types::Node;

    #[test]
    fn test_missing_node() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 1, &config);
        let err = tx.ensure_service("nope", ServiceInstance::new("web", 80)).unwrap_err();
        assert!(matches!(err, StoreError::MissingNode));
    }

    #[test]
    fn test_rename_retires_old_name() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 1, &config);
        tx.ensure_node(Node::new("n1", "10.0.0.1")).unwrap();
        tx.ensure_service("n1", ServiceInstance::new("web", 80).with_id("svc1")).unwrap();
        let (db, _, _) = tx.into_parts();

        let mut tx = WriteTxn::new(db, 2, &config);
        tx.ensure_service("n1", ServiceInstance::new("api", 80).with_id("svc1")).unwrap();
        let (db, _, _) = tx.into_parts();

        assert_eq!(db.index_value("service.web"), None);
        assert_eq!(db.index_value("service.api"), Some(2));
        assert_eq!(db.index_value("service_last_extinction"), Some(2));
    }

    #[test]
    fn test_service_row_uses_stored_node_name() {
        let config = StoreConfig::default();
        let mut tx = WriteTxn::new(Db::new(), 1, &config);
        tx.ensure_node(Node::new("Node1", "10.0.0.1")).unwrap();
        tx.ensure_service("node1", ServiceInstance::new("web", 80)).unwrap();

        let svc = tx.service_on_node("NODE1", "web").unwrap();
        assert_eq!(svc.node, "Node1");
    }
}
