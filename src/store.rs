//! The catalog store: transaction lifecycle, queries, events and snapshots.

use crate::catalog::{Db, ReadTxn, TxnOp, TxnResult, WriteTxn};
use crate::error::{Result, StoreError};
use crate::events::{
    derive_events, snapshot_events, CatalogOp, DropReason, Event, EventPayload, EventPublisher,
    SubscribeRequest, Subscription, SubscriptionId, Topic,
};
use crate::snapshot::{Restore, RestoreStats, Snapshot};
use crate::types::{
    CheckServiceNode, Coordinate, HealthCheck, HealthStatus, Meta, Node, NodeId, NodeInfo, NodeServices,
    RegisterRequest, ServiceInstance, ServiceKind, ServiceNode, Session,
};
use crate::watch::{Notifier, WatchPlanner, WatchSet};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

/// Store configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Most per-row watch handles one query arms before falling back to
    /// whole-table handles.
    /// Default: 2048
    pub watch_limit: usize,

    /// Check ID whose health decides whether a node's name may be taken.
    /// Default: "serfHealth"
    pub liveness_check_id: String,

    /// Events buffered per subscriber before it is dropped.
    /// Default: 1000
    pub event_buffer_size: usize,

    /// Reject malformed node and service metadata.
    /// Default: true
    pub validate_metadata: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            watch_limit: 2048,
            liveness_check_id: "serfHealth".to_string(),
            event_buffer_size: 1000,
            validate_metadata: true,
        }
    }
}

impl StoreConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Point-in-time counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub node_count: usize,
    pub service_count: usize,
    pub check_count: usize,
    pub index_entry_count: usize,
    pub subscriber_count: usize,
    pub armed_watch_count: usize,
    /// Commits applied since the store was created.
    pub generation: u64,
}

/// The service catalog.
///
/// Provides a unified interface for:
/// - Registering and deregistering nodes, services and checks
/// - Blocking-query reads that report a logical index
/// - Subscribing to derived change events
/// - Snapshotting and restoring the whole catalog
///
/// Writers are serialized; readers work on the last committed version and
/// never block.
pub struct Store {
    config: StoreConfig,

    /// Last committed version.
    root: ArcSwap<Db>,

    /// Serializes writers, and subscribers against writers.
    write_lock: Mutex<()>,

    notifier: Arc<Notifier>,

    publisher: EventPublisher,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let publisher = EventPublisher::new(config.event_buffer_size);
        Self {
            config,
            root: ArcSwap::from_pointee(Db::new()),
            write_lock: Mutex::new(()),
            notifier: Arc::new(Notifier::new()),
            publisher,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// A read transaction over the last committed version.
    pub fn read_txn(&self) -> ReadTxn {
        ReadTxn::new(
            self.root.load_full(),
            Arc::clone(&self.notifier),
            WatchPlanner::new(self.config.watch_limit),
        )
    }

    /// Run `f` in a write transaction stamped with `idx`.
    ///
    /// If `f` fails nothing is visible. Otherwise the new version is
    /// published, touched watches fire and derived events go out. A
    /// transaction that changed nothing publishes nothing.
    pub fn write<T, F>(&self, idx: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let _guard = self.write_lock.lock();
        let current = self.root.load_full();
        let mut tx = WriteTxn::new((*current).clone(), idx, &self.config);
        let out = f(&mut tx)?;
        if !tx.has_changes() {
            return Ok(out);
        }

        let (mut db, changes, touched) = tx.into_parts();
        let events = derive_events(&db, idx, &changes)?;
        db.generation = current.generation + 1;
        let generation = db.generation;

        self.root.store(Arc::new(db));
        let fired = self.notifier.fire(touched, generation);
        self.publisher.publish(&events);

        debug!(idx, changes = changes.len(), events = events.len(), fired, "committed");
        Ok(out)
    }

    // --- Mutations ---

    pub fn ensure_registration(&self, idx: u64, req: RegisterRequest) -> Result<()> {
        self.write(idx, |tx| tx.ensure_registration(req))
    }

    pub fn ensure_node(&self, idx: u64, node: Node) -> Result<()> {
        self.write(idx, |tx| tx.ensure_node(node))
    }

    pub fn ensure_node_cas(&self, idx: u64, node: Node) -> Result<bool> {
        self.write(idx, |tx| tx.ensure_node_cas(node))
    }

    pub fn delete_node(&self, idx: u64, name: &str) -> Result<()> {
        self.write(idx, |tx| tx.delete_node(name))
    }

    pub fn delete_node_cas(&self, idx: u64, cidx: u64, name: &str) -> Result<bool> {
        self.write(idx, |tx| tx.delete_node_cas(name, cidx))
    }

    pub fn ensure_service(&self, idx: u64, node: &str, svc: ServiceInstance) -> Result<()> {
        self.write(idx, |tx| tx.ensure_service(node, svc))
    }

    pub fn ensure_service_cas(&self, idx: u64, node: &str, svc: ServiceInstance) -> Result<bool> {
        self.write(idx, |tx| tx.ensure_service_cas(node, svc))
    }

    pub fn delete_service(&self, idx: u64, node: &str, service_id: &str) -> Result<()> {
        self.write(idx, |tx| tx.delete_service(node, service_id))
    }

    pub fn delete_service_cas(&self, idx: u64, cidx: u64, node: &str, service_id: &str) -> Result<bool> {
        self.write(idx, |tx| tx.delete_service_cas(node, service_id, cidx))
    }

    pub fn ensure_check(&self, idx: u64, check: HealthCheck) -> Result<()> {
        self.write(idx, |tx| tx.ensure_check(check))
    }

    pub fn ensure_check_cas(&self, idx: u64, check: HealthCheck) -> Result<bool> {
        self.write(idx, |tx| tx.ensure_check_cas(check))
    }

    pub fn delete_check(&self, idx: u64, node: &str, check_id: &str) -> Result<()> {
        self.write(idx, |tx| tx.delete_check(node, check_id))
    }

    pub fn delete_check_cas(&self, idx: u64, cidx: u64, node: &str, check_id: &str) -> Result<bool> {
        self.write(idx, |tx| tx.delete_check_cas(node, check_id, cidx))
    }

    /// Apply a batch of operations atomically.
    pub fn txn(&self, idx: u64, ops: Vec<TxnOp>) -> Result<Vec<TxnResult>> {
        self.write(idx, |tx| tx.apply_ops(ops))
    }

    pub fn create_session(&self, idx: u64, session: Session) -> Result<()> {
        self.write(idx, |tx| tx.create_session(session))
    }

    pub fn delete_session(&self, idx: u64, id: &str) -> Result<()> {
        self.write(idx, |tx| tx.delete_session(id))
    }

    pub fn ensure_coordinate(&self, idx: u64, coord: Coordinate) -> Result<()> {
        self.write(idx, |tx| tx.ensure_coordinate(coord))
    }

    // --- Queries ---

    pub fn get_node(&self, ws: Option<&mut WatchSet>, name: &str) -> Result<(u64, Option<Arc<Node>>)> {
        self.read_txn().get_node(ws, name)
    }

    pub fn get_node_id(&self, ws: Option<&mut WatchSet>, id: NodeId) -> Result<(u64, Option<Arc<Node>>)> {
        self.read_txn().get_node_id(ws, id)
    }

    pub fn nodes(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Arc<Node>>)> {
        self.read_txn().nodes(ws)
    }

    pub fn nodes_by_meta(&self, ws: Option<&mut WatchSet>, filters: &Meta) -> Result<(u64, Vec<Arc<Node>>)> {
        self.read_txn().nodes_by_meta(ws, filters)
    }

    pub fn services(&self, ws: Option<&mut WatchSet>) -> Result<(u64, BTreeMap<String, Vec<String>>)> {
        self.read_txn().services(ws)
    }

    pub fn service_nodes(&self, ws: Option<&mut WatchSet>, service: &str) -> Result<(u64, Vec<ServiceNode>)> {
        self.read_txn().service_nodes(ws, service)
    }

    pub fn service_tag_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
        tags: &[&str],
    ) -> Result<(u64, Vec<ServiceNode>)> {
        self.read_txn().service_tag_nodes(ws, service, tags)
    }

    pub fn connect_service_nodes(&self, ws: Option<&mut WatchSet>, service: &str) -> Result<(u64, Vec<ServiceNode>)> {
        self.read_txn().connect_service_nodes(ws, service)
    }

    pub fn node_service(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
        service_id: &str,
    ) -> Result<(u64, Option<Arc<ServiceInstance>>)> {
        self.read_txn().node_service(ws, node, service_id)
    }

    pub fn node_services(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Option<NodeServices>)> {
        self.read_txn().node_services(ws, node)
    }

    pub fn node_check(&self, node: &str, check_id: &str) -> Result<(u64, Option<Arc<HealthCheck>>)> {
        self.read_txn().node_check(node, check_id)
    }

    pub fn node_checks(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        self.read_txn().node_checks(ws, node)
    }

    pub fn service_checks(&self, ws: Option<&mut WatchSet>, service: &str) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        self.read_txn().service_checks(ws, service)
    }

    pub fn checks_in_state(
        &self,
        ws: Option<&mut WatchSet>,
        state: Option<HealthStatus>,
    ) -> Result<(u64, Vec<Arc<HealthCheck>>)> {
        self.read_txn().checks_in_state(ws, state)
    }

    pub fn check_service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.read_txn().check_service_nodes(ws, service)
    }

    pub fn check_connect_service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.read_txn().check_connect_service_nodes(ws, service)
    }

    pub fn check_service_tag_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
        tags: &[&str],
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.read_txn().check_service_tag_nodes(ws, service, tags)
    }

    pub fn node_info(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Option<NodeInfo>)> {
        self.read_txn().node_info(ws, node)
    }

    pub fn node_dump(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<NodeInfo>)> {
        self.read_txn().node_dump(ws)
    }

    pub fn service_dump(
        &self,
        ws: Option<&mut WatchSet>,
        kind: Option<ServiceKind>,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        self.read_txn().service_dump(ws, kind)
    }

    pub fn coordinates(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Arc<Coordinate>>)> {
        self.read_txn().coordinates(ws)
    }

    pub fn node_sessions(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Vec<Arc<Session>>)> {
        self.read_txn().node_sessions(ws, node)
    }

    // --- Events ---

    /// Register events describing the current joined state of `service`
    /// on a health topic, at the index a live stream would continue from.
    pub fn service_health_snapshot(&self, topic: Topic, service: &str) -> Result<(u64, Vec<Event>)> {
        let tx = self.read_txn();
        let (idx, results) = match topic {
            Topic::ServiceHealth => tx.check_service_nodes(None, service)?,
            Topic::ServiceHealthConnect => tx.check_connect_service_nodes(None, service)?,
            Topic::ServiceList => {
                return Err(StoreError::InvalidOperation(format!(
                    "no health snapshot for topic {}",
                    topic
                )))
            }
        };
        Ok((idx, snapshot_events(topic, idx, results)))
    }

    fn initial_events(&self, req: &SubscribeRequest) -> Result<(u64, Vec<Event>)> {
        match (req.topic, &req.key) {
            (Topic::ServiceList, _) => {
                let (idx, names) = self.read_txn().services(None)?;
                let events = names
                    .into_keys()
                    .map(|name| Event {
                        topic: Topic::ServiceList,
                        key: name.clone(),
                        index: idx,
                        op: CatalogOp::Register,
                        payload: EventPayload::ServiceName(name),
                    })
                    .filter(|e| req.matches(e))
                    .collect();
                Ok((idx, events))
            }
            (topic, Some(key)) => self.service_health_snapshot(topic, key),
            (topic, None) => {
                let (idx, results) = self.read_txn().service_dump(None, None)?;
                Ok((idx, snapshot_events(topic, idx, results)))
            }
        }
    }

    /// Subscribe to live events, starting with a snapshot of the current
    /// state for the requested key.
    pub fn subscribe(&self, req: SubscribeRequest) -> Result<Subscription> {
        // Holding the write lock keeps commits out between the snapshot
        // and registration.
        let _guard = self.write_lock.lock();
        let (idx, events) = self.initial_events(&req)?;
        Ok(self.publisher.subscribe_with_snapshot(req, events, idx))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.publisher.unsubscribe(id)
    }

    // --- Snapshot / restore ---

    /// A point-in-time copy of the whole catalog.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.root.load_full())
    }

    /// Replace the whole catalog with restored rows.
    ///
    /// Every armed watch fires and every subscriber is dropped, since
    /// nothing they observed is guaranteed to still hold.
    pub fn restore(&self, restore: Restore) -> Result<RestoreStats> {
        let stats = restore.stats();
        let _guard = self.write_lock.lock();
        let mut db = restore.into_db();
        db.generation = self.root.load().generation + 1;
        let generation = db.generation;

        self.root.store(Arc::new(db));
        let fired = self.notifier.fire_all(generation);
        self.publisher.reset(DropReason::Reset);

        info!(
            nodes = stats.nodes,
            services = stats.services,
            checks = stats.checks,
            index_entries = stats.index_entries,
            coordinates = stats.coordinates,
            sessions = stats.sessions,
            fired,
            "restored catalog"
        );
        Ok(stats)
    }

    /// Restore from a stream written by [`Snapshot::persist`].
    pub fn restore_from<R: Read>(&self, reader: &mut R) -> Result<RestoreStats> {
        let restore = Restore::read_from(reader)?;
        self.restore(restore)
    }

    pub fn stats(&self) -> CatalogStats {
        let db = self.root.load();
        CatalogStats {
            node_count: db.nodes().len(),
            service_count: db.services().len(),
            check_count: db.checks().len(),
            index_entry_count: db.index().len(),
            subscriber_count: self.publisher.subscriber_count(),
            armed_watch_count: self.notifier.armed_count(),
            generation: db.generation(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = StoreConfig::from_json(r#"{"watch_limit": 16}"#).unwrap();
        assert_eq!(config.watch_limit, 16);
        assert_eq!(config.liveness_check_id, "serfHealth");
        assert!(config.validate_metadata);

        assert!(StoreConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_failed_write_publishes_nothing() {
        let store = Store::default();
        let err = store
            .ensure_service(1, "missing", ServiceInstance::new("web", 80))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingNode));
        assert_eq!(store.stats().generation, 0);
    }

    #[test]
    fn test_noop_write_keeps_generation() {
        let store = Store::default();
        store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
        store.ensure_node(2, Node::new("n1", "10.0.0.1")).unwrap();
        assert_eq!(store.stats().generation, 1);
    }
}
