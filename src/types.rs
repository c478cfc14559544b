//! Core types for the catalog: nodes, service instances, health checks and
//! the index counters that version them.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Free-form string metadata attached to nodes and services.
pub type Meta = BTreeMap<String, String>;

/// Meta key prefix reserved for internal use.
pub const META_KEY_RESERVED_PREFIX: &str = "consul-";

/// Maximum number of metadata pairs.
pub const META_MAX_KEY_PAIRS: usize = 64;

/// Maximum length of a metadata key.
pub const META_KEY_MAX_LENGTH: usize = 128;

/// Maximum length of a metadata value.
pub const META_VALUE_MAX_LENGTH: usize = 512;

/// Stable identity of a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a random node ID.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(NodeId)
            .map_err(|e| StoreError::Validation(format!("invalid node ID {:?}: {}", s, e)))
    }
}

/// A cluster node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Option<NodeId>,
    /// Case-insensitive primary lookup key.
    pub name: String,
    pub address: String,
    pub datacenter: String,
    pub tagged_addresses: BTreeMap<String, String>,
    pub meta: Meta,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Field-for-field comparison ignoring the raft indexes.
    pub fn is_same(&self, other: &Node) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.address == other.address
            && self.datacenter == other.datacenter
            && self.tagged_addresses == other.tagged_addresses
            && self.meta == other.meta
    }
}

/// The role a service instance plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    #[default]
    Typical,
    ConnectProxy,
    MeshGateway,
    TerminatingGateway,
    IngressGateway,
    ApiGateway,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Typical => "typical",
            ServiceKind::ConnectProxy => "connect-proxy",
            ServiceKind::MeshGateway => "mesh-gateway",
            ServiceKind::TerminatingGateway => "terminating-gateway",
            ServiceKind::IngressGateway => "ingress-gateway",
            ServiceKind::ApiGateway => "api-gateway",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream a sidecar proxy routes to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub destination_name: String,
    pub local_bind_port: u16,
}

/// Sidecar proxy settings of a connect-proxy instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub destination_service_name: String,
    pub destination_service_id: String,
    pub local_service_address: String,
    pub local_service_port: u16,
    pub upstreams: Vec<Upstream>,
}

/// A service instance registered on a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Name of the owning node.
    pub node: String,
    /// Unique per node.
    pub id: String,
    pub service: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub kind: ServiceKind,
    pub proxy: ProxyConfig,
    pub connect_native: bool,
    pub meta: Meta,
    pub enable_tag_override: bool,
    pub create_index: u64,
    pub modify_index: u64,
}

impl ServiceInstance {
    /// A typical service whose ID equals its name.
    pub fn new(service: impl Into<String>, port: u16) -> Self {
        let service = service.into();
        Self {
            id: service.clone(),
            service,
            port,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// A sidecar proxy fronting `destination`.
    pub fn connect_proxy(service: impl Into<String>, port: u16, destination: impl Into<String>) -> Self {
        let mut svc = Self::new(service, port);
        svc.kind = ServiceKind::ConnectProxy;
        svc.proxy.destination_service_name = destination.into();
        svc
    }

    /// Name under which this instance is reachable through the mesh, if any.
    ///
    /// Proxies answer for their destination, natives for themselves.
    pub fn connect_name(&self) -> Option<&str> {
        if self.connect_native {
            Some(&self.service)
        } else if self.kind == ServiceKind::ConnectProxy
            && !self.proxy.destination_service_name.is_empty()
        {
            Some(&self.proxy.destination_service_name)
        } else {
            None
        }
    }

    /// Logical equality: every field except the raft indexes.
    pub fn is_same_service(&self, other: &ServiceInstance) -> bool {
        self.node.eq_ignore_ascii_case(&other.node)
            && self.id == other.id
            && self.service == other.service
            && self.tags == other.tags
            && self.address == other.address
            && self.port == other.port
            && self.kind == other.kind
            && self.proxy == other.proxy
            && self.connect_native == other.connect_native
            && self.meta == other.meta
            && self.enable_tag_override == other.enable_tag_override
    }
}

/// Health of a check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    /// Terminal failing state; also the status of checks registered without one.
    #[default]
    Critical,
    Maintenance,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "passing" => Ok(HealthStatus::Passing),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            "maintenance" => Ok(HealthStatus::Maintenance),
            other => Err(StoreError::Validation(format!("unknown health status {:?}", other))),
        }
    }
}

/// A health check on a node, optionally scoped to one service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    /// Unique per node.
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    pub notes: String,
    pub output: String,
    /// Empty for node-level checks.
    pub service_id: String,
    /// Copied from the service at write time.
    pub service_name: String,
    /// Copied from the service at write time.
    pub service_tags: Vec<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl HealthCheck {
    /// A node-level check.
    pub fn node_check(node: impl Into<String>, check_id: impl Into<String>, status: HealthStatus) -> Self {
        let check_id = check_id.into();
        Self {
            node: node.into(),
            name: check_id.clone(),
            check_id,
            status,
            ..Default::default()
        }
    }

    /// A check scoped to `service_id` on `node`.
    pub fn service_check(
        node: impl Into<String>,
        check_id: impl Into<String>,
        service_id: impl Into<String>,
        status: HealthStatus,
    ) -> Self {
        let mut check = Self::node_check(node, check_id, status);
        check.service_id = service_id.into();
        check
    }

    pub fn is_node_level(&self) -> bool {
        self.service_id.is_empty()
    }

    /// Comparison ignoring the raft indexes.
    pub fn is_same(&self, other: &HealthCheck) -> bool {
        self.node.eq_ignore_ascii_case(&other.node)
            && self.check_id == other.check_id
            && self.name == other.name
            && self.status == other.status
            && self.notes == other.notes
            && self.output == other.output
            && self.service_id == other.service_id
            && self.service_name == other.service_name
            && self.service_tags == other.service_tags
    }
}

/// A monotonically increasing counter keyed by logical name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub value: u64,
}

/// Network coordinate of a node, owned by the coordinate subsystem.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub node: String,
    pub segment: String,
    pub coord: Vec<f64>,
}

/// A session pinned to a node and some of its checks, owned by the session subsystem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub node: String,
    pub node_checks: Vec<String>,
    pub service_checks: Vec<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// Atomic registration of a node and optionally a service and checks.
#[derive(Clone, Debug, Default)]
pub struct RegisterRequest {
    pub id: Option<NodeId>,
    pub node: String,
    pub address: String,
    pub datacenter: String,
    pub tagged_addresses: BTreeMap<String, String>,
    pub node_meta: Meta,
    pub service: Option<ServiceInstance>,
    pub check: Option<HealthCheck>,
    pub checks: Vec<HealthCheck>,
}

impl RegisterRequest {
    pub fn new(node: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: ServiceInstance) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// The node row this request describes.
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id,
            name: self.node.clone(),
            address: self.address.clone(),
            datacenter: self.datacenter.clone(),
            tagged_addresses: self.tagged_addresses.clone(),
            meta: self.node_meta.clone(),
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Whether applying this request would change the stored node.
    pub fn changes_node(&self, node: &Node) -> bool {
        self.id != node.id
            || !self.node.eq_ignore_ascii_case(&node.name)
            || self.address != node.address
            || self.datacenter != node.datacenter
            || self.tagged_addresses != node.tagged_addresses
            || self.node_meta != node.meta
    }
}

/// A service instance joined with its node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node: Arc<Node>,
    pub service: Arc<ServiceInstance>,
}

/// A service instance joined with its node and every check that applies to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Arc<Node>,
    pub service: Arc<ServiceInstance>,
    /// Node-level checks first, then service checks.
    pub checks: Vec<Arc<HealthCheck>>,
}

/// All services registered on one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Arc<Node>,
    pub services: BTreeMap<String, Arc<ServiceInstance>>,
}

/// A node with everything registered against it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: Arc<Node>,
    pub services: Vec<Arc<ServiceInstance>>,
    pub checks: Vec<Arc<HealthCheck>>,
}

/// Validate a metadata map.
///
/// Keys must be short alphanumerics (plus `-` and `_`) outside the
/// reserved prefix unless `allow_reserved` is set.
pub fn validate_metadata(meta: &Meta, allow_reserved: bool) -> Result<()> {
    if meta.len() > META_MAX_KEY_PAIRS {
        return Err(StoreError::Validation(format!(
            "metadata cannot contain more than {} key/value pairs",
            META_MAX_KEY_PAIRS
        )));
    }

    for (key, value) in meta {
        validate_meta_pair(key, value, allow_reserved).map_err(|reason| {
            StoreError::Validation(format!("couldn't load metadata pair ({:?}, {:?}): {}", key, value, reason))
        })?;
    }

    Ok(())
}

fn validate_meta_pair(key: &str, value: &str, allow_reserved: bool) -> std::result::Result<(), String> {
    if key.is_empty() {
        return Err("key cannot be blank".into());
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("key contains invalid characters".into());
    }
    if key.len() > META_KEY_MAX_LENGTH {
        return Err(format!("key is too long (limit: {} characters)", META_KEY_MAX_LENGTH));
    }
    if !allow_reserved && key.starts_with(META_KEY_RESERVED_PREFIX) {
        return Err(format!("key prefix {:?} is reserved for internal use", META_KEY_RESERVED_PREFIX));
    }
    if value.len() > META_VALUE_MAX_LENGTH {
        return Err(format!("value is too long (limit: {} characters)", META_VALUE_MAX_LENGTH));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_is_same_ignores_indexes() {
        let mut a = Node::new("n1", "10.0.0.1");
        let mut b = a.clone();
        a.create_index = 1;
        b.modify_index = 9;
        assert!(a.is_same(&b));

        b.address = "10.0.0.2".into();
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_connect_name() {
        let proxy = ServiceInstance::connect_proxy("web-proxy", 20000, "web");
        assert_eq!(proxy.connect_name(), Some("web"));

        let mut native = ServiceInstance::new("db", 5432);
        assert_eq!(native.connect_name(), None);
        native.connect_native = true;
        assert_eq!(native.connect_name(), Some("db"));
    }

    #[test]
    fn test_default_status_is_critical() {
        assert_eq!(HealthStatus::default(), HealthStatus::Critical);
        assert_eq!("warning".parse::<HealthStatus>().unwrap(), HealthStatus::Warning);
    }

    #[test]
    fn test_validate_metadata() {
        let mut meta = Meta::new();
        meta.insert("rack".into(), "r1".into());
        assert!(validate_metadata(&meta, false).is_ok());

        meta.insert("k".repeat(META_KEY_MAX_LENGTH + 1), "v".into());
        assert!(matches!(validate_metadata(&meta, false), Err(StoreError::Validation(_))));

        let mut reserved = Meta::new();
        reserved.insert("consul-version".into(), "1".into());
        assert!(validate_metadata(&reserved, false).is_err());
        assert!(validate_metadata(&reserved, true).is_ok());

        let mut bad = Meta::new();
        bad.insert("has space".into(), "v".into());
        assert!(validate_metadata(&bad, false).is_err());
    }

    #[test]
    fn test_changes_node() {
        let req = RegisterRequest::new("N1", "10.0.0.1");
        let node = Node::new("n1", "10.0.0.1");
        assert!(!req.changes_node(&node));

        let moved = Node::new("n1", "10.0.0.9");
        assert!(req.changes_node(&moved));
    }
}
