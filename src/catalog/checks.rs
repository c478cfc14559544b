//! Health check upsert and delete.

use super::nodes::cas_matches;
use super::schema::check_key;
use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::types::{HealthCheck, HealthStatus};
use std::sync::Arc;

impl WriteTxn<'_> {
    pub(crate) fn check_on_node(&self, node: &str, check_id: &str) -> Option<Arc<HealthCheck>> {
        self.get::<HealthCheck>(&check_key(node, check_id))
    }

    /// Upsert a health check.
    ///
    /// Service checks take the service's current name and tags. An
    /// unchanged check keeps its modify index but is rewritten, and the
    /// checks table index always moves. A critical check invalidates the
    /// sessions pinned to it.
    pub fn ensure_check(&mut self, check: HealthCheck) -> Result<()> {
        let mut hc = check;
        let owner = self.node_by_name(&hc.node).ok_or(StoreError::MissingNode)?;
        hc.node = owner.name.clone();

        let existing = self.check_on_node(&hc.node, &hc.check_id);
        let idx = self.index();
        match &existing {
            Some(current) => {
                hc.create_index = current.create_index;
                hc.modify_index = current.modify_index;
            }
            None => hc.create_index = idx,
        }

        let modified;
        if !hc.service_id.is_empty() {
            let svc = self
                .service_on_node(&hc.node, &hc.service_id)
                .ok_or(StoreError::MissingService)?;
            hc.service_name = svc.service.clone();
            hc.service_tags = svc.tags.clone();
            modified = !existing.as_ref().map_or(false, |c| c.is_same(&hc));
            if modified {
                self.update_service_index(&svc.service)?;
                self.update_service_kind_index(svc.kind)?;
            }
        } else {
            hc.service_name.clear();
            hc.service_tags.clear();
            modified = !existing.as_ref().map_or(false, |c| c.is_same(&hc));
            if modified {
                // Node checks are part of every service's health on the node.
                let node = hc.node.clone();
                self.update_all_service_indexes_of_node(&node)?;
            }
        }

        if hc.status == HealthStatus::Critical {
            self.invalidate_check_sessions(&hc.node, &hc.check_id)?;
        }

        if modified {
            hc.modify_index = idx;
        }
        self.insert(hc)?;
        self.update_checks_index()
    }

    /// Create-or-update a check under compare-and-swap on its modify index.
    pub fn ensure_check_cas(&mut self, check: HealthCheck) -> Result<bool> {
        let stored = self
            .check_on_node(&check.node, &check.check_id)
            .map(|c| c.modify_index);
        if !cas_matches(check.modify_index, stored) {
            return Ok(false);
        }
        self.ensure_check(check)?;
        Ok(true)
    }

    /// Delete a check and invalidate the sessions pinned to it.
    pub fn delete_check(&mut self, node: &str, check_id: &str) -> Result<()> {
        let hc = match self.check_on_node(node, check_id) {
            Some(hc) => hc,
            None => return Ok(()),
        };

        if !hc.service_id.is_empty() {
            if let Some(svc) = self.service_on_node(&hc.node, &hc.service_id) {
                self.update_service_index(&svc.service)?;
                self.update_service_kind_index(svc.kind)?;
            }
        } else {
            self.update_all_service_indexes_of_node(&hc.node)?;
            self.update_services_index()?;
        }

        self.delete::<HealthCheck>(&check_key(&hc.node, &hc.check_id));
        self.update_checks_index()?;
        self.invalidate_check_sessions(&hc.node, &hc.check_id)?;
        Ok(())
    }

    /// Delete a check only if its modify index equals `cidx`.
    pub fn delete_check_cas(&mut self, node: &str, check_id: &str, cidx: u64) -> Result<bool> {
        match self.check_on_node(node, check_id) {
            Some(hc) if hc.modify_index == cidx => {
                self.delete_check(node, check_id)?;
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
    use crate::types::{Node, ServiceInstance};

    fn seeded(config: &StoreConfig) -> WriteTxn<'_> {
        let mut tx = WriteTxn::new(Db::new(), 1, config);
        tx.ensure_node(Node::new("n1", "10.0.0.1")).unwrap();
        tx.ensure_service("n1", ServiceInstance::new("web", 80).with_tags(&["v1"]))
            .unwrap();
        tx
    }

    #[test]
    fn test_missing_service() {
        let config = StoreConfig::default();
        let mut tx = seeded(&config);
        let check = HealthCheck::service_check("n1", "c1", "nope", HealthStatus::Passing);
        assert!(matches!(tx.ensure_check(check), Err(StoreError::MissingService)));
    }

    #[test]
    fn test_denormalizes_service_fields() {
        let config = StoreConfig::default();
        let mut tx = seeded(&config);
        tx.ensure_check(HealthCheck::service_check("n1", "c1", "web", HealthStatus::Passing))
            .unwrap();

        let hc = tx.check_on_node("n1", "c1").unwrap();
        assert_eq!(hc.service_name, "web");
        assert_eq!(hc.service_tags, vec!["v1".to_string()]);
    }

    #[test]
    fn test_unchanged_check_keeps_modify_index() {
        let config = StoreConfig::default();
        let mut tx = seeded(&config);
        tx.ensure_check(HealthCheck::node_check("n1", "c1", HealthStatus::Passing))
            .unwrap();
        let (db, _, _) = tx.into_parts();

        let mut tx = WriteTxn::new(db, 5, &config);
        tx.ensure_check(HealthCheck::node_check("n1", "c1", HealthStatus::Passing))
            .unwrap();
        let hc = tx.check_on_node("n1", "c1").unwrap();
        assert_eq!(hc.modify_index, 1);
        assert_eq!(tx.db().index_value("checks"), Some(5));
        assert_eq!(tx.db().index_value("service.web"), Some(1));
    }
}
