//! Node upsert, identity reconciliation and cascading delete.

use super::schema::{check_key, node_key, INDEX_NODE, INDEX_UUID};
use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::memdb::IndexKey;
use crate::types::{validate_metadata, Coordinate, HealthCheck, HealthStatus, Node, NodeId, ServiceInstance};
use std::sync::Arc;
use tracing::debug;

impl WriteTxn<'_> {
    pub(crate) fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.get::<Node>(&node_key(name))
    }

    pub(crate) fn node_by_id(&self, id: NodeId) -> Result<Option<Arc<Node>>> {
        self.table::<Node>()
            .first_by(INDEX_UUID, &IndexKey::exact(id.to_string()))
    }

    /// Upsert a node, reconciling its identity against stored nodes.
    ///
    /// A node with an ID that is already known under another name is a
    /// rename: the old row is deleted with everything on it and the node
    /// is re-inserted under the new name with its original create index.
    /// A write that changes nothing observable leaves the row untouched.
    pub fn ensure_node(&mut self, node: Node) -> Result<()> {
        if self.config().validate_metadata {
            validate_metadata(&node.meta, false)?;
        }

        let mut node = node;
        let mut existing = None;
        if let Some(id) = node.id {
            match self.node_by_id(id)? {
                Some(current) => {
                    if !current.name.eq_ignore_ascii_case(&node.name) {
                        self.ensure_no_node_with_similar_name(&node, false)?;
                        debug!(id = %id, from = %current.name, to = %node.name, "renaming node");
                        self.delete_node(&current.name)?;
                    }
                    existing = Some(current);
                }
                None => {
                    // Nodes registered without an ID may be claimed.
                    self.ensure_no_node_with_similar_name(&node, true)?;
                }
            }
        }

        if existing.is_none() {
            existing = self.node_by_name(&node.name);
        }

        let idx = self.index();
        match existing {
            Some(current) => {
                if current.name.eq_ignore_ascii_case(&node.name) {
                    node.name = current.name.clone();
                }
                node.create_index = current.create_index;
                node.modify_index = current.modify_index;
                if node.is_same(&current) {
                    return Ok(());
                }
                node.modify_index = idx;
            }
            None => {
                node.create_index = idx;
                node.modify_index = idx;
            }
        }

        self.insert_node(node)
    }

    /// Create-or-update a node under compare-and-swap.
    ///
    /// `modify_index == 0` only creates; otherwise the stored row must carry
    /// exactly that modify index. A lost race returns `false`.
    pub fn ensure_node_cas(&mut self, node: Node) -> Result<bool> {
        let existing = self.node_by_name(&node.name);
        if !cas_matches(node.modify_index, existing.as_ref().map(|n| n.modify_index)) {
            return Ok(false);
        }
        self.ensure_node(node)?;
        Ok(true)
    }

    /// Reject `node` if its name is held by a different, live node.
    ///
    /// A holder whose liveness check is missing or critical gives the name
    /// up. With `allow_clash_without_id`, a holder with no ID does too.
    fn ensure_no_node_with_similar_name(&self, node: &Node, allow_clash_without_id: bool) -> Result<()> {
        let holder = match self.node_by_name(&node.name) {
            Some(holder) if holder.id != node.id => holder,
            _ => return Ok(()),
        };

        let liveness =
            self.get::<HealthCheck>(&check_key(&holder.name, &self.config().liveness_check_id));
        let healthy = liveness.map_or(false, |c| c.status != HealthStatus::Critical);

        if healthy && !(holder.id.is_none() && allow_clash_without_id) {
            debug!(name = %node.name, holder = %holder.name, "node name conflict");
            return Err(StoreError::NodeNameConflict {
                name: node.name.clone(),
                existing_id: holder.id.map(|id| id.to_string()).unwrap_or_default(),
                existing_name: holder.name.clone(),
            });
        }
        Ok(())
    }

    /// Insert a node row and bump every index whose results echo it.
    fn insert_node(&mut self, node: Node) -> Result<()> {
        let name = node.name.clone();
        self.insert(node)?;
        self.update_nodes_index()?;
        self.update_all_service_indexes_of_node(&name)
    }

    /// Bump the name and kind index of every service on a node.
    pub(crate) fn update_all_service_indexes_of_node(&mut self, node: &str) -> Result<()> {
        let services = self
            .table::<ServiceInstance>()
            .get_by(INDEX_NODE, &node_key(node))?;
        for svc in services {
            self.update_service_index(&svc.service)?;
            self.update_service_kind_index(svc.kind)?;
        }
        Ok(())
    }

    /// Delete a node with its services, checks, coordinates and sessions.
    pub fn delete_node(&mut self, name: &str) -> Result<()> {
        let node = match self.node_by_name(name) {
            Some(node) => node,
            None => return Ok(()),
        };
        let key = node_key(&node.name);

        let services = self.table::<ServiceInstance>().get_by(INDEX_NODE, &key)?;
        for svc in &services {
            self.update_service_index(&svc.service)?;
            self.update_service_kind_index(svc.kind)?;
        }
        for svc in &services {
            self.delete_service(&node.name, &svc.id)?;
        }

        let checks = self.table::<HealthCheck>().get_by(INDEX_NODE, &key)?;
        for check in &checks {
            self.delete_check(&node.name, &check.check_id)?;
        }

        let coords = self.table::<Coordinate>().get_by(INDEX_NODE, &key)?;
        for coord in &coords {
            self.delete_coordinate(coord)?;
        }

        self.delete::<Node>(&key);
        self.update_nodes_index()?;

        let sessions = self.invalidate_node_sessions(&node.name)?;

        debug!(
            node = %node.name,
            services = services.len(),
            checks = checks.len(),
            coordinates = coords.len(),
            sessions,
            "deleted node"
        );
        Ok(())
    }

    /// Delete a node only if its modify index equals `cidx`.
    pub fn delete_node_cas(&mut self, name: &str, cidx: u64) -> Result<bool> {
        match self.node_by_name(name) {
            Some(node) if node.modify_index == cidx => {
                self.delete_node(name)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Compare-and-swap precondition shared by every ensure CAS variant.
pub(crate) fn cas_matches(expected: u64, stored: Option<u64>) -> bool {
    match (expected, stored) {
        (0, None) => true,
        (0, Some(_)) => false,
        (_, None) => false,
        (expected, Some(stored)) => expected == stored,
    }
}
