//! Turns one transaction's row changes into publishable events.
//!
//! Changes are first folded into marks per node and per instance, then
//! each mark is materialized against the committed tables. All
//! deregistrations are emitted before any registration, so a rename
//! always reaches a subscriber as "old gone" then "new here".

use super::types::{CatalogOp, Event, EventPayload, Topic};
use crate::catalog::{service_from_index_name, AnyChange, Db, INDEX_NODE};
use crate::error::{Result, StoreError};
use crate::memdb::{Change, IndexKey};
use crate::types::{CheckServiceNode, HealthCheck, IndexEntry, Node, ServiceInstance, ServiceKind};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeKind {
    /// Something this entity's joined result depends on changed.
    Indirect,
    Delete,
    Create,
    Update,
}

impl ChangeKind {
    fn of<R>(change: &Change<R>) -> Self {
        if change.deleted() {
            ChangeKind::Delete
        } else if change.created() {
            ChangeKind::Create
        } else {
            ChangeKind::Update
        }
    }
}

/// Insertion-ordered marks. A direct mark replaces an indirect one, never
/// the other way round.
struct Marks<K, V> {
    order: Vec<K>,
    marks: HashMap<K, (ChangeKind, Option<V>)>,
}

impl<K: Clone + Eq + Hash, V> Marks<K, V> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            marks: HashMap::new(),
        }
    }

    fn mark(&mut self, key: K, kind: ChangeKind, value: Option<V>) {
        match self.marks.get_mut(&key) {
            Some(existing) => {
                if existing.0 == ChangeKind::Indirect {
                    *existing = (kind, value);
                }
            }
            None => {
                self.order.push(key.clone());
                self.marks.insert(key, (kind, value));
            }
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.marks.contains_key(key)
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &(ChangeKind, Option<V>))> + '_ {
        self.order.iter().filter_map(move |k| self.marks.get(k).map(|m| (k, m)))
    }
}

type NodeKey = String;
type InstanceKey = (String, String);

fn instance_key(node: &str, service_id: &str) -> InstanceKey {
    (node.to_lowercase(), service_id.to_string())
}

/// Derive every event produced by one committed transaction.
///
/// `db` is the state after the transaction. Counts per instance hold per
/// topic: a new connect proxy yields one `ServiceHealth` event and one
/// `ServiceHealthConnect` event, plus a `ServiceList` event when it is the
/// first instance of its name.
pub fn derive_events(db: &Db, idx: u64, changes: &[AnyChange]) -> Result<Vec<Event>> {
    let mut nodes: Marks<NodeKey, ()> = Marks::new();
    let mut services: Marks<InstanceKey, &Change<ServiceInstance>> = Marks::new();
    let mut deregs = Vec::new();
    let mut regs = Vec::new();

    for change in changes {
        match change {
            AnyChange::Node(c) => {
                if let Some(node) = c.object() {
                    nodes.mark(node.name.to_lowercase(), ChangeKind::of(c), None);
                }
            }
            AnyChange::Service(c) => {
                if let Some(svc) = c.object() {
                    services.mark(instance_key(&svc.node, &svc.id), ChangeKind::of(c), Some(c));
                }
            }
            AnyChange::Check(c) => mark_check(c, &mut nodes, &mut services),
            AnyChange::Index(c) => {
                if let Some(event) = service_list_event(c, idx) {
                    match event.op {
                        CatalogOp::Deregister => deregs.push(event),
                        CatalogOp::Register => regs.push(event),
                    }
                }
            }
            AnyChange::Coordinate(_) | AnyChange::Session(_) => {}
        }
    }

    for (node, (kind, _)) in nodes.iter() {
        // Deleting a node also deleted its instances; those carry the events.
        if *kind == ChangeKind::Delete {
            continue;
        }
        regs.extend(node_events(db, idx, node)?);
    }

    for (key, (kind, change)) in services.iter() {
        if *kind == ChangeKind::Delete {
            if let Some(before) = change.and_then(|c| c.before.as_ref()) {
                deregs.push(deregister_event(idx, before));
            }
            continue;
        }

        if *kind == ChangeKind::Update {
            if let Some(Change {
                before: Some(before),
                after: Some(after),
            }) = change
            {
                if before.service != after.service {
                    deregs.push(deregister_event(idx, before));
                }
                if let Some(event) = proxy_destination_change(idx, before, after) {
                    deregs.push(event);
                }
            }
        }

        if nodes.contains(&key.0) {
            continue;
        }
        regs.push(instance_event(db, idx, key)?);
    }

    let mut events = Vec::with_capacity(deregs.len() + regs.len());
    for batch in [deregs, regs] {
        let projected: Vec<Event> = batch.iter().filter_map(connect_projection).collect();
        events.extend(batch);
        events.extend(projected);
    }
    Ok(events)
}

fn mark_check<'c>(
    change: &'c Change<HealthCheck>,
    nodes: &mut Marks<NodeKey, ()>,
    services: &mut Marks<InstanceKey, &'c Change<ServiceInstance>>,
) {
    match (&change.before, &change.after) {
        (Some(before), Some(after)) => {
            // Rewritten but unchanged.
            if before.is_same(after) {
                return;
            }
            if before.is_node_level() || after.is_node_level() {
                nodes.mark(after.node.to_lowercase(), ChangeKind::Indirect, None);
            } else {
                services.mark(instance_key(&after.node, &after.service_id), ChangeKind::Indirect, None);
                if before.service_id != after.service_id {
                    services.mark(instance_key(&before.node, &before.service_id), ChangeKind::Indirect, None);
                }
            }
        }
        (Some(hc), None) | (None, Some(hc)) => {
            if hc.is_node_level() {
                nodes.mark(hc.node.to_lowercase(), ChangeKind::Indirect, None);
            } else {
                services.mark(instance_key(&hc.node, &hc.service_id), ChangeKind::Indirect, None);
            }
        }
        (None, None) => {}
    }
}

fn service_list_event(change: &Change<IndexEntry>, idx: u64) -> Option<Event> {
    let op = if change.created() {
        CatalogOp::Register
    } else if change.deleted() {
        CatalogOp::Deregister
    } else {
        return None;
    };
    let entry = change.object()?;
    let name = service_from_index_name(&entry.key)?;
    Some(Event {
        topic: Topic::ServiceList,
        key: name.to_string(),
        index: idx,
        op,
        payload: EventPayload::ServiceName(name.to_string()),
    })
}

/// The connect-topic copy of a health event, if the instance is reachable
/// through the mesh.
pub(crate) fn connect_projection(event: &Event) -> Option<Event> {
    if event.topic != Topic::ServiceHealth {
        return None;
    }
    let svc = &event.check_service_node()?.service;
    if svc.connect_native {
        return Some(event.to_connect(&svc.service));
    }
    match svc.kind {
        ServiceKind::ConnectProxy => Some(event.to_connect(&svc.proxy.destination_service_name)),
        _ => None,
    }
}

/// Register events replaying joined results onto a health topic.
pub(crate) fn snapshot_events(topic: Topic, idx: u64, results: Vec<CheckServiceNode>) -> Vec<Event> {
    results
        .into_iter()
        .map(|csn| register_event(idx, csn.node, csn.service, csn.checks))
        .filter_map(|event| match topic {
            Topic::ServiceHealthConnect => connect_projection(&event),
            _ => Some(event),
        })
        .collect()
}

/// A proxy retargeted at another destination leaves the old one's
/// connect topic, though the proxy itself still exists.
fn proxy_destination_change(idx: u64, before: &Arc<ServiceInstance>, after: &ServiceInstance) -> Option<Event> {
    if before.kind != ServiceKind::ConnectProxy
        || before.proxy.destination_service_name == after.proxy.destination_service_name
    {
        return None;
    }
    Some(deregister_event(idx, before).to_connect(&before.proxy.destination_service_name))
}

fn register_event(idx: u64, node: Arc<Node>, svc: Arc<ServiceInstance>, checks: Vec<Arc<HealthCheck>>) -> Event {
    Event {
        topic: Topic::ServiceHealth,
        key: svc.service.clone(),
        index: idx,
        op: CatalogOp::Register,
        payload: EventPayload::CheckServiceNode(CheckServiceNode {
            node,
            service: svc,
            checks,
        }),
    }
}

/// Deregistrations only carry the node name: the node row may be gone.
fn deregister_event(idx: u64, svc: &Arc<ServiceInstance>) -> Event {
    Event {
        topic: Topic::ServiceHealth,
        key: svc.service.clone(),
        index: idx,
        op: CatalogOp::Deregister,
        payload: EventPayload::CheckServiceNode(CheckServiceNode {
            node: Arc::new(Node {
                name: svc.node.clone(),
                ..Default::default()
            }),
            service: Arc::clone(svc),
            checks: Vec::new(),
        }),
    }
}

/// A node row and its checks split into node-level and per-service.
struct NodeChecks {
    node: Arc<Node>,
    node_level: Vec<Arc<HealthCheck>>,
    by_service: HashMap<String, Vec<Arc<HealthCheck>>>,
}

impl NodeChecks {
    fn load(db: &Db, node: &str) -> Result<Self> {
        let key = IndexKey::lower(node);
        let owner = db.nodes().get(&key).cloned().ok_or(StoreError::MissingNode)?;
        let mut node_level = Vec::new();
        let mut by_service: HashMap<String, Vec<Arc<HealthCheck>>> = HashMap::new();
        for check in db.checks().get_by(INDEX_NODE, &key)? {
            if check.is_node_level() {
                node_level.push(check);
            } else {
                by_service.entry(check.service_id.clone()).or_default().push(check);
            }
        }
        Ok(Self {
            node: owner,
            node_level,
            by_service,
        })
    }

    fn for_service(&self, service_id: &str) -> Vec<Arc<HealthCheck>> {
        let mut checks = self.node_level.clone();
        if let Some(svc_checks) = self.by_service.get(service_id) {
            checks.extend(svc_checks.iter().cloned());
        }
        checks
    }
}

/// Register events for every instance on a node.
fn node_events(db: &Db, idx: u64, node: &str) -> Result<Vec<Event>> {
    let loaded = NodeChecks::load(db, node)?;
    let services = db.services().get_by(INDEX_NODE, &IndexKey::lower(node))?;
    Ok(services
        .into_iter()
        .map(|svc| {
            let checks = loaded.for_service(&svc.id);
            register_event(idx, Arc::clone(&loaded.node), svc, checks)
        })
        .collect())
}

fn instance_event(db: &Db, idx: u64, key: &InstanceKey) -> Result<Event> {
    let loaded = NodeChecks::load(db, &key.0)?;
    let svc = db
        .services()
        .get(&IndexKey::lower(&key.0).push(key.1.clone()))
        .cloned()
        .ok_or(StoreError::MissingService)?;
    let checks = loaded.for_service(&svc.id);
    Ok(register_event(idx, loaded.node, svc, checks))
}
