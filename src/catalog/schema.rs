//! Table definitions and the versioned table set.

use crate::memdb::{Change, IndexKey, IndexSchema, Table, TableSchema};
use crate::types::{Coordinate, HealthCheck, IndexEntry, Node, ServiceInstance, Session};
use std::sync::Arc;

pub const TABLE_NODES: &str = "nodes";
pub const TABLE_SERVICES: &str = "services";
pub const TABLE_CHECKS: &str = "checks";
pub const TABLE_INDEX: &str = "index";
pub const TABLE_COORDINATES: &str = "coordinates";
pub const TABLE_SESSIONS: &str = "sessions";

pub const INDEX_UUID: &str = "uuid";
pub const INDEX_META: &str = "meta";
pub const INDEX_NODE: &str = "node";
pub const INDEX_SERVICE: &str = "service";
pub const INDEX_CONNECT: &str = "connect";
pub const INDEX_KIND: &str = "kind";
pub const INDEX_STATUS: &str = "status";
pub const INDEX_NODE_SERVICE: &str = "node_service";
pub const INDEX_CHECK: &str = "check";

pub(crate) fn node_key(name: &str) -> IndexKey {
    IndexKey::lower(name)
}

pub(crate) fn service_key(node: &str, service_id: &str) -> IndexKey {
    IndexKey::lower(node).push(service_id)
}

pub(crate) fn check_key(node: &str, check_id: &str) -> IndexKey {
    IndexKey::lower(node).push(check_id)
}

pub(crate) fn index_key(name: &str) -> IndexKey {
    IndexKey::lower(name)
}

fn nodes_schema() -> TableSchema<Node> {
    TableSchema {
        name: TABLE_NODES,
        primary: |n| node_key(&n.name),
        indexes: vec![
            IndexSchema {
                name: INDEX_UUID,
                unique: true,
                extract: |n| n.id.map(|id| IndexKey::exact(id.to_string())).into_iter().collect(),
            },
            IndexSchema {
                name: INDEX_META,
                unique: false,
                extract: |n| n.meta.iter().map(|(k, v)| IndexKey::new([k.as_str(), v.as_str()])).collect(),
            },
        ],
    }
}

fn services_schema() -> TableSchema<ServiceInstance> {
    TableSchema {
        name: TABLE_SERVICES,
        primary: |s| service_key(&s.node, &s.id),
        indexes: vec![
            IndexSchema {
                name: INDEX_NODE,
                unique: false,
                extract: |s| vec![node_key(&s.node)],
            },
            IndexSchema {
                name: INDEX_SERVICE,
                unique: false,
                extract: |s| vec![IndexKey::lower(&s.service)],
            },
            IndexSchema {
                name: INDEX_CONNECT,
                unique: false,
                extract: |s| s.connect_name().map(IndexKey::lower).into_iter().collect(),
            },
            IndexSchema {
                name: INDEX_KIND,
                unique: false,
                extract: |s| vec![IndexKey::exact(s.kind.as_str())],
            },
        ],
    }
}

fn checks_schema() -> TableSchema<HealthCheck> {
    TableSchema {
        name: TABLE_CHECKS,
        primary: |c| check_key(&c.node, &c.check_id),
        indexes: vec![
            IndexSchema {
                name: INDEX_NODE,
                unique: false,
                extract: |c| vec![node_key(&c.node)],
            },
            IndexSchema {
                name: INDEX_STATUS,
                unique: false,
                extract: |c| vec![IndexKey::exact(c.status.as_str())],
            },
            IndexSchema {
                name: INDEX_SERVICE,
                unique: false,
                extract: |c| {
                    if c.service_name.is_empty() {
                        Vec::new()
                    } else {
                        vec![IndexKey::lower(&c.service_name)]
                    }
                },
            },
            IndexSchema {
                name: INDEX_NODE_SERVICE,
                unique: false,
                extract: |c| vec![node_key(&c.node).push(c.service_id.clone())],
            },
        ],
    }
}

fn index_schema() -> TableSchema<IndexEntry> {
    TableSchema {
        name: TABLE_INDEX,
        primary: |e| index_key(&e.key),
        indexes: Vec::new(),
    }
}

fn coordinates_schema() -> TableSchema<Coordinate> {
    TableSchema {
        name: TABLE_COORDINATES,
        primary: |c| node_key(&c.node).push(c.segment.clone()),
        indexes: vec![IndexSchema {
            name: INDEX_NODE,
            unique: false,
            extract: |c| vec![node_key(&c.node)],
        }],
    }
}

fn sessions_schema() -> TableSchema<Session> {
    TableSchema {
        name: TABLE_SESSIONS,
        primary: |s| IndexKey::exact(s.id.clone()),
        indexes: vec![
            IndexSchema {
                name: INDEX_NODE,
                unique: false,
                extract: |s| vec![node_key(&s.node)],
            },
            IndexSchema {
                name: INDEX_CHECK,
                unique: false,
                extract: |s| {
                    s.node_checks
                        .iter()
                        .chain(s.service_checks.iter())
                        .map(|id| check_key(&s.node, id))
                        .collect()
                },
            },
        ],
    }
}

/// One consistent version of every catalog table.
///
/// Cloning is cheap: tables are shared until a write transaction first
/// modifies them, and a modified table copies only the map paths it
/// touches.
#[derive(Clone, Debug)]
pub struct Db {
    pub(crate) nodes: Arc<Table<Node>>,
    pub(crate) services: Arc<Table<ServiceInstance>>,
    pub(crate) checks: Arc<Table<HealthCheck>>,
    pub(crate) index: Arc<Table<IndexEntry>>,
    pub(crate) coordinates: Arc<Table<Coordinate>>,
    pub(crate) sessions: Arc<Table<Session>>,
    /// Count of commits that produced this version.
    pub(crate) generation: u64,
}

impl Db {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(Table::new(Arc::new(nodes_schema()))),
            services: Arc::new(Table::new(Arc::new(services_schema()))),
            checks: Arc::new(Table::new(Arc::new(checks_schema()))),
            index: Arc::new(Table::new(Arc::new(index_schema()))),
            coordinates: Arc::new(Table::new(Arc::new(coordinates_schema()))),
            sessions: Arc::new(Table::new(Arc::new(sessions_schema()))),
            generation: 0,
        }
    }

    pub fn nodes(&self) -> &Table<Node> {
        &self.nodes
    }

    pub fn services(&self) -> &Table<ServiceInstance> {
        &self.services
    }

    pub fn checks(&self) -> &Table<HealthCheck> {
        &self.checks
    }

    pub fn index(&self) -> &Table<IndexEntry> {
        &self.index
    }

    pub fn coordinates(&self) -> &Table<Coordinate> {
        &self.coordinates
    }

    pub fn sessions(&self) -> &Table<Session> {
        &self.sessions
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

/// A row-level mutation in any catalog table.
#[derive(Clone, Debug)]
pub enum AnyChange {
    Node(Change<Node>),
    Service(Change<ServiceInstance>),
    Check(Change<HealthCheck>),
    Index(Change<IndexEntry>),
    Coordinate(Change<Coordinate>),
    Session(Change<Session>),
}

impl AnyChange {
    pub fn table(&self) -> &'static str {
        match self {
            AnyChange::Node(_) => TABLE_NODES,
            AnyChange::Service(_) => TABLE_SERVICES,
            AnyChange::Check(_) => TABLE_CHECKS,
            AnyChange::Index(_) => TABLE_INDEX,
            AnyChange::Coordinate(_) => TABLE_COORDINATES,
            AnyChange::Session(_) => TABLE_SESSIONS,
        }
    }
}

/// Binds a row type to its table within a [`Db`].
pub trait TableRow: crate::memdb::Row + Sized {
    const TABLE: &'static str;

    fn table(db: &Db) -> &Arc<Table<Self>>;
    fn table_mut(db: &mut Db) -> &mut Arc<Table<Self>>;
    fn wrap(change: Change<Self>) -> AnyChange;
    fn change_mut(change: &mut AnyChange) -> Option<&mut Change<Self>>;
}

macro_rules! table_row {
    ($row:ty, $table:expr, $field:ident, $variant:ident) => {
        impl TableRow for $row {
            const TABLE: &'static str = $table;

            fn table(db: &Db) -> &Arc<Table<Self>> {
                &db.$field
            }

            fn table_mut(db: &mut Db) -> &mut Arc<Table<Self>> {
                &mut db.$field
            }

            fn wrap(change: Change<Self>) -> AnyChange {
                AnyChange::$variant(change)
            }

            fn change_mut(change: &mut AnyChange) -> Option<&mut Change<Self>> {
                match change {
                    AnyChange::$variant(c) => Some(c),
                    _ => None,
                }
            }
        }
    };
}

table_row!(Node, TABLE_NODES, nodes, Node);
table_row!(ServiceInstance, TABLE_SERVICES, services, Service);
table_row!(HealthCheck, TABLE_CHECKS, checks, Check);
table_row!(IndexEntry, TABLE_INDEX, index, Index);
table_row!(Coordinate, TABLE_COORDINATES, coordinates, Coordinate);
table_row!(Session, TABLE_SESSIONS, sessions, Session);
