//! # Service Catalog
//!
//! An in-memory, transactional registry of nodes, the service instances
//! they run and the health checks attached to either, with blocking
//! queries and a change-event stream.
//!
//! ## Core Concepts
//!
//! - **Catalog**: Nodes, services and checks kept consistent across every
//!   write, with per-entity create/modify indexes
//! - **Index table**: Named logical indexes readers use to tell whether
//!   anything they depend on changed
//! - **Watches**: Handles a blocking reader waits on until a commit
//!   touches what it read
//! - **Events**: Per-commit register/deregister events for service health,
//!   connect health and the service list
//! - **Snapshots**: Framed, checksummed dumps of the whole catalog
//!
//! ## Example
//!
//! ```ignore
//! use catalog::{HealthCheck, HealthStatus, RegisterRequest, ServiceInstance, Store, WatchSet};
//!
//! let store = Store::default();
//! store.ensure_registration(
//!     1,
//!     RegisterRequest::new("node1", "10.0.0.1")
//!         .with_service(ServiceInstance::new("web", 80))
//!         .with_check(HealthCheck::service_check("node1", "web-alive", "web", HealthStatus::Passing)),
//! )?;
//!
//! let mut ws = WatchSet::new();
//! let (index, web) = store.check_service_nodes(Some(&mut ws), "web")?;
//!
//! // Blocks until a commit touches something the query read.
//! ws.wait_timeout(std::time::Duration::from_secs(5));
//! ```

pub mod catalog;
pub mod error;
pub mod events;
pub mod memdb;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod watch;

// Re-exports
pub use catalog::{ReadTxn, TxnEntity, TxnOp, TxnResult, TxnVerb, WriteTxn};
pub use error::{Result, StoreError};
pub use events::{
    CatalogOp, DropReason, Event, EventPayload, SubscribeRequest, Subscription, SubscriptionEvent,
    SubscriptionId, Topic,
};
pub use snapshot::{Restore, RestoreStats, Snapshot};
pub use store::{CatalogStats, Store, StoreConfig};
pub use types::*;
pub use watch::{WatchCh, WatchKey, WatchSet};
