//! Change events derived from committed transactions.
//!
//! Every commit that changes the catalog is turned into an ordered list of
//! [`Event`]s on three topics:
//! - service health, keyed by service name
//! - connect service health, keyed by the name a proxy or native instance
//!   answers for
//! - the service list, keyed by service name
//!
//! Subscribers receive a snapshot of the current state for their key,
//! an end-of-snapshot marker, then live events. Slow subscribers are
//! dropped rather than allowed to stall commits.
//!
//! # Example
//!
//! ```ignore
//! let sub = store.subscribe(SubscribeRequest::new(Topic::ServiceHealth, "web"))?;
//! loop {
//!     match sub.recv() {
//!         Ok(SubscriptionEvent::Event { event }) => println!("{:?} {}", event.op, event.key),
//!         Ok(SubscriptionEvent::EndOfSnapshot { index }) => println!("live from {}", index),
//!         Ok(SubscriptionEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod derive;
mod publisher;
mod types;

pub(crate) use derive::snapshot_events;
pub use derive::derive_events;
pub use publisher::EventPublisher;
pub use types::{
    CatalogOp, DropReason, Event, EventPayload, SubscribeRequest, Subscription, SubscriptionEvent,
    SubscriptionId, Topic,
};
