//! Read queries. Each returns the logical index a blocking caller should
//! compare against, and arms watch handles into the caller's set.

use super::indexes::{index_entry_watch, service_index_name, service_kind_index_name, SERVICE_LAST_EXTINCTION};
use super::schema::{
    check_key, node_key, service_key, INDEX_CONNECT, INDEX_KIND, INDEX_META, INDEX_NODE, INDEX_NODE_SERVICE,
    INDEX_SERVICE, INDEX_STATUS, INDEX_UUID, TABLE_CHECKS, TABLE_COORDINATES, TABLE_NODES, TABLE_SERVICES,
    TABLE_SESSIONS,
};
use super::txn::ReadTxn;
use crate::error::{Result, StoreError};
use crate::memdb::{IndexKey, PRIMARY};
use crate::types::{
    CheckServiceNode, Coordinate, HealthCheck, HealthStatus, Meta, Node, NodeId, NodeInfo, NodeServices,
    ServiceInstance, ServiceKind, ServiceNode, Session,
};
use crate::watch::{JoinWatch, WatchKey, WatchSet};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

type Ws<'w> = Option<&'w mut WatchSet>;

fn service_matches_tags(svc: &ServiceInstance, tags: &[&str]) -> bool {
    tags.iter()
        .all(|tag| svc.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
}

impl ReadTxn {
    // --- Nodes ---

    /// Look up a node by name, case-insensitively.
    pub fn get_node(&self, mut ws: Ws<'_>, name: &str) -> Result<(u64, Option<Arc<Node>>)> {
        let idx = self.db().max_index(&[TABLE_NODES]);
        let key = node_key(name);
        self.arm(&mut ws, WatchKey::index(TABLE_NODES, PRIMARY, key.clone()));
        Ok((idx, self.db().nodes().get(&key).cloned()))
    }

    pub fn get_node_id(&self, mut ws: Ws<'_>, id: NodeId) -> Result<(u64, Option<Arc<Node>>)> {
        let idx = self.db().max_index(&[TABLE_NODES]);
        let key = IndexKey::exact(id.to_string());
        self.arm(&mut ws, WatchKey::index(TABLE_NODES, INDEX_UUID, key.clone()));
        Ok((idx, self.db().nodes().first_by(INDEX_UUID, &key)?))
    }

    pub fn nodes(&self, mut ws: Ws<'_>) -> Result<(u64, Vec<Arc<Node>>)> {
        let idx = self.db().max_index(&[TABLE_NODES]);
        self.arm(&mut ws, WatchKey::Table(TABLE_NODES));
        Ok((idx, self.db().nodes().iter().cloned().collect()))
    }

    /// Nodes carrying every given meta pair. Only the first pair is
    /// looked up by index; the rest filter.
    pub fn nodes_by_meta(&self, mut ws: Ws<'_>, filters: &Meta) -> Result<(u64, Vec<Arc<Node>>)> {
        let idx = self.db().max_index(&[TABLE_NODES]);
        let candidates = match filters.iter().next() {
            Some((k, v)) => {
                let key = IndexKey::new([k.as_str(), v.as_str()]);
                self.arm(&mut ws, WatchKey::index(TABLE_NODES, INDEX_META, key.clone()));
                self.db().nodes().get_by(INDEX_META, &key)?
            }
            None => {
                self.arm(&mut ws, WatchKey::Table(TABLE_NODES));
                self.db().nodes().iter().cloned().collect()
            }
        };
        let nodes = candidates
            .into_iter()
            .filter(|n| filters.iter().all(|(k, v)| n.meta.get(k) == Some(v)))
            .collect();
        Ok((idx, nodes))
    }

    // --- Services ---

    /// Every service name with the union of its instances' tags.
    pub fn services(&self, mut ws: Ws<'_>) -> Result<(u64, BTreeMap<String, Vec<String>>)> {
        let idx = self.db().max_index(&[TABLE_SERVICES]);
        self.arm(&mut ws, WatchKey::Table(TABLE_SERVICES));

        let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for svc in self.db().services().iter() {
            tags.entry(svc.service.clone())
                .or_default()
                .extend(svc.tags.iter().cloned());
        }
        Ok((idx, tags.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect()))
    }

    pub fn service_nodes(&self, ws: Ws<'_>, service: &str) -> Result<(u64, Vec<ServiceNode>)> {
        self.service_nodes_by(ws, INDEX_SERVICE, service, &[])
    }

    /// Instances of `service` carrying every tag in `tags`, compared
    /// case-insensitively.
    pub fn service_tag_nodes(&self, ws: Ws<'_>, service: &str, tags: &[&str]) -> Result<(u64, Vec<ServiceNode>)> {
        self.service_nodes_by(ws, INDEX_SERVICE, service, tags)
    }

    /// Proxies and native instances reachable as `service` through the mesh.
    pub fn connect_service_nodes(&self, ws: Ws<'_>, service: &str) -> Result<(u64, Vec<ServiceNode>)> {
        self.service_nodes_by(ws, INDEX_CONNECT, service, &[])
    }

    fn service_nodes_by(
        &self,
        mut ws: Ws<'_>,
        index: &'static str,
        service: &str,
        tags: &[&str],
    ) -> Result<(u64, Vec<ServiceNode>)> {
        let key = IndexKey::lower(service);
        let found = self.db().services().get_by(index, &key)?;
        self.arm(&mut ws, WatchKey::index(TABLE_SERVICES, index, key));

        let (idx, _) = self.service_index(service, !found.is_empty(), false);
        let matching: Vec<_> = found
            .into_iter()
            .filter(|svc| service_matches_tags(svc, tags))
            .collect();

        let mut results = Vec::with_capacity(matching.len());
        for svc in matching {
            let node = self.watched_node(&mut ws, &svc.node)?;
            results.push(ServiceNode { node, service: svc });
        }
        Ok((idx, results))
    }

    pub fn node_service(
        &self,
        mut ws: Ws<'_>,
        node: &str,
        service_id: &str,
    ) -> Result<(u64, Option<Arc<ServiceInstance>>)> {
        let idx = self.db().max_index(&[TABLE_SERVICES]);
        let key = service_key(node, service_id);
        self.arm(&mut ws, WatchKey::index(TABLE_SERVICES, PRIMARY, key.clone()));
        Ok((idx, self.db().services().get(&key).cloned()))
    }

    /// A node and its services, keyed by service ID.
    pub fn node_services(&self, mut ws: Ws<'_>, node: &str) -> Result<(u64, Option<NodeServices>)> {
        let idx = self.db().catalog_max_index(false);
        let key = node_key(node);
        self.arm(&mut ws, WatchKey::index(TABLE_NODES, PRIMARY, key.clone()));

        let owner = match self.db().nodes().get(&key) {
            Some(owner) => Arc::clone(owner),
            None => return Ok((idx, None)),
        };
        self.arm(&mut ws, WatchKey::index(TABLE_SERVICES, INDEX_NODE, key.clone()));
        let services = self
            .db()
            .services()
            .get_by(INDEX_NODE, &key)?
            .into_iter()
            .map(|svc| (svc.id.clone(), svc))
            .collect();
        Ok((idx, Some(NodeServices { node: owner, services })))
    }

    // --- Checks ---

    pub fn node_check(&self, node: &str, check_id: &str) -> Result<(u64, Option<Arc<HealthCheck>>)> {
        let idx = self.db().max_index(&[TABLE_CHECKS]);
        Ok((idx, self.db().checks().get(&check_key(node, check_id)).cloned()))
    }

    pub fn node_checks(&self, mut ws: Ws<'_>, node: &str) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        let idx = self.db().max_index(&[TABLE_CHECKS]);
        let key = node_key(node);
        self.arm(&mut ws, WatchKey::index(TABLE_CHECKS, INDEX_NODE, key.clone()));
        Ok((idx, self.db().checks().get_by(INDEX_NODE, &key)?))
    }

    /// Checks attached to any instance of `service`.
    pub fn service_checks(&self, mut ws: Ws<'_>, service: &str) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        let idx = self.db().max_index(&[TABLE_CHECKS]);
        let key = IndexKey::lower(service);
        self.arm(&mut ws, WatchKey::index(TABLE_CHECKS, INDEX_SERVICE, key.clone()));
        Ok((idx, self.db().checks().get_by(INDEX_SERVICE, &key)?))
    }

    /// Checks in `state`, or every check when `state` is `None`.
    pub fn checks_in_state(
        &self,
        mut ws: Ws<'_>,
        state: Option<HealthStatus>,
    ) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        let idx = self.db().max_index(&[TABLE_CHECKS]);
        let checks = match state {
            Some(status) => {
                let key = IndexKey::exact(status.as_str());
                self.arm(&mut ws, WatchKey::index(TABLE_CHECKS, INDEX_STATUS, key.clone()));
                self.db().checks().get_by(INDEX_STATUS, &key)?
            }
            None => {
                self.arm(&mut ws, WatchKey::Table(TABLE_CHECKS));
                self.db().checks().iter().cloned().collect()
            }
        };
        Ok((idx, checks))
    }

    // --- Joined health queries ---

    /// Instances of `service` with their node and checks.
    pub fn check_service_nodes(&self, ws: Ws<'_>, service: &str) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.check_service_nodes_txn(ws, service, false)
    }

    /// Mesh-reachable instances of `service` with their node and checks.
    pub fn check_connect_service_nodes(&self, ws: Ws<'_>, service: &str) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.check_service_nodes_txn(ws, service, true)
    }

    fn check_service_nodes_txn(
        &self,
        mut ws: Ws<'_>,
        service: &str,
        connect: bool,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        let index = if connect { INDEX_CONNECT } else { INDEX_SERVICE };
        let key = IndexKey::lower(service);
        let results = self.db().services().get_by(index, &key)?;
        let lookup = WatchKey::index(TABLE_SERVICES, index, key);

        // A connect result may span several proxy names.
        let mut names = BTreeMap::new();
        for svc in &results {
            names
                .entry(svc.service.to_lowercase())
                .or_insert_with(|| svc.service.clone());
        }

        let mut idx = 0;
        let plan = if names.is_empty() {
            let (extinct, _) = self.service_index(service, false, true);
            idx = idx.max(extinct);
            JoinWatch::Coarse
        } else {
            let mut narrow = Vec::with_capacity(names.len());
            for name in names.values() {
                let (svc_idx, key) = self.service_index(name, true, true);
                idx = idx.max(svc_idx);
                narrow.push(key);
            }
            self.planner().plan(narrow)
        };

        match plan {
            JoinWatch::Narrow(keys) => {
                for key in keys {
                    self.arm(&mut ws, key);
                }
                // New proxy names for this destination only show up here.
                if connect {
                    self.arm(&mut ws, lookup);
                }
                self.parse_check_service_nodes(None, idx, results)
            }
            JoinWatch::Coarse => {
                self.arm(&mut ws, lookup);
                self.parse_check_service_nodes(ws, idx, results)
            }
        }
    }

    /// Instances of `service` carrying every tag in `tags`, joined with
    /// their node and checks.
    pub fn check_service_tag_nodes(
        &self,
        mut ws: Ws<'_>,
        service: &str,
        tags: &[&str],
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        let key = IndexKey::lower(service);
        let found = self.db().services().get_by(INDEX_SERVICE, &key)?;
        self.arm(&mut ws, WatchKey::index(TABLE_SERVICES, INDEX_SERVICE, key));

        let (idx, _) = self.service_index(service, !found.is_empty(), true);
        let results = found
            .into_iter()
            .filter(|svc| service_matches_tags(svc, tags))
            .collect();
        self.parse_check_service_nodes(ws, idx, results)
    }

    /// Every instance with its node and checks, optionally of one kind.
    pub fn service_dump(
        &self,
        mut ws: Ws<'_>,
        kind: Option<ServiceKind>,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        match kind {
            Some(kind) => {
                let name = service_kind_index_name(kind);
                let idx = self.db().index_value(&name).unwrap_or(0);
                self.arm(&mut ws, index_entry_watch(&name));
                let key = IndexKey::exact(kind.as_str());
                self.arm(&mut ws, WatchKey::index(TABLE_SERVICES, INDEX_KIND, key.clone()));
                let services = self.db().services().get_by(INDEX_KIND, &key)?;
                self.parse_check_service_nodes(ws, idx, services)
            }
            None => {
                let idx = self.db().catalog_max_index(true);
                self.arm(&mut ws, WatchKey::Table(TABLE_SERVICES));
                let services = self.db().services().iter().cloned().collect();
                self.parse_check_service_nodes(ws, idx, services)
            }
        }
    }

    /// Logical index and narrow watch key for one service name.
    ///
    /// An absent service reports the extinction index, which nothing can
    /// watch incrementally.
    fn service_index(&self, service: &str, exists: bool, checks: bool) -> (u64, Option<WatchKey>) {
        if !exists {
            if let Some(extinct) = self.db().index_value(SERVICE_LAST_EXTINCTION) {
                return (extinct, None);
            }
        }
        let name = service_index_name(service);
        match self.db().index_value(&name) {
            Some(idx) => (idx, Some(index_entry_watch(&name))),
            None => (self.db().catalog_max_index(checks), None),
        }
    }

    /// Join instances with their node and checks, node checks first.
    fn parse_check_service_nodes(
        &self,
        mut ws: Ws<'_>,
        idx: u64,
        services: Vec<Arc<ServiceInstance>>,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        let mut results = Vec::with_capacity(services.len());
        for svc in services {
            let node = self.watched_node(&mut ws, &svc.node)?;
            let mut checks = self.watched_checks(&mut ws, &svc.node, "")?;
            checks.extend(self.watched_checks(&mut ws, &svc.node, &svc.id)?);
            results.push(CheckServiceNode {
                node,
                service: svc,
                checks,
            });
        }
        Ok((idx, results))
    }

    fn watched_node(&self, ws: &mut Ws<'_>, name: &str) -> Result<Arc<Node>> {
        let key = node_key(name);
        self.arm_row(
            ws,
            WatchKey::index(TABLE_NODES, PRIMARY, key.clone()),
            WatchKey::Table(TABLE_NODES),
        );
        self.db()
            .nodes()
            .get(&key)
            .cloned()
            .ok_or(StoreError::MissingNode)
    }

    fn watched_checks(&self, ws: &mut Ws<'_>, node: &str, service_id: &str) -> Result<Vec<Arc<HealthCheck>>> {
        let key = node_key(node).push(service_id);
        self.arm_row(
            ws,
            WatchKey::index(TABLE_CHECKS, INDEX_NODE_SERVICE, key.clone()),
            WatchKey::Table(TABLE_CHECKS),
        );
        self.db().checks().get_by(INDEX_NODE_SERVICE, &key)
    }

    // --- Dumps ---

    /// One node with all of its services and checks.
    pub fn node_info(&self, mut ws: Ws<'_>, node: &str) -> Result<(u64, Option<NodeInfo>)> {
        let idx = self.db().catalog_max_index(true);
        let key = node_key(node);
        self.arm(&mut ws, WatchKey::index(TABLE_NODES, PRIMARY, key.clone()));
        let info = match self.db().nodes().get(&key) {
            Some(owner) => Some(self.node_dump_entry(&mut ws, Arc::clone(owner))?),
            None => None,
        };
        Ok((idx, info))
    }

    /// Every node with all of its services and checks.
    pub fn node_dump(&self, mut ws: Ws<'_>) -> Result<(u64, Vec<NodeInfo>)> {
        let idx = self.db().catalog_max_index(true);
        self.arm(&mut ws, WatchKey::Table(TABLE_NODES));
        let mut dump = Vec::with_capacity(self.db().nodes().len());
        for node in self.db().nodes().iter() {
            dump.push(self.node_dump_entry(&mut ws, Arc::clone(node))?);
        }
        Ok((idx, dump))
    }

    fn node_dump_entry(&self, ws: &mut Ws<'_>, node: Arc<Node>) -> Result<NodeInfo> {
        let key = node_key(&node.name);
        self.arm_row(
            ws,
            WatchKey::index(TABLE_SERVICES, INDEX_NODE, key.clone()),
            WatchKey::Table(TABLE_SERVICES),
        );
        self.arm_row(
            ws,
            WatchKey::index(TABLE_CHECKS, INDEX_NODE, key.clone()),
            WatchKey::Table(TABLE_CHECKS),
        );
        Ok(NodeInfo {
            services: self.db().services().get_by(INDEX_NODE, &key)?,
            checks: self.db().checks().get_by(INDEX_NODE, &key)?,
            node,
        })
    }

    // --- Collaborators ---

    pub fn coordinates(&self, mut ws: Ws<'_>) -> Result<(u64, Vec<Arc<Coordinate>>)> {
        let idx = self.db().max_index(&[TABLE_COORDINATES]);
        self.arm(&mut ws, WatchKey::Table(TABLE_COORDINATES));
        Ok((idx, self.db().coordinates().iter().cloned().collect()))
    }

    pub fn node_sessions(&self, mut ws: Ws<'_>, node: &str) -> Result<(u64, Vec<Arc<Session>>)> {
        let idx = self.db().max_index(&[TABLE_SESSIONS]);
        let key = node_key(node);
        self.arm(&mut ws, WatchKey::index(TABLE_SESSIONS, INDEX_NODE, key.clone()));
        Ok((idx, self.db().sessions().get_by(INDEX_NODE, &key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter_is_case_insensitive() {
        let svc = ServiceInstance::new("web", 80).with_tags(&["Primary", "v1"]);
        assert!(service_matches_tags(&svc, &["primary"]));
        assert!(service_matches_tags(&svc, &["primary", "V1"]));
        assert!(!service_matches_tags(&svc, &["primary", "v2"]));
        assert!(service_matches_tags(&svc, &[]));
    }
}
