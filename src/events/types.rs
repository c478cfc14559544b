//! Event and subscription types.

use crate::types::CheckServiceNode;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stream an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Joined health of instances, keyed by service name.
    ServiceHealth,
    /// Joined health of mesh-reachable instances, keyed by the name they
    /// answer for.
    ServiceHealthConnect,
    /// Service names appearing and disappearing.
    ServiceList,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::ServiceHealth => "service_health",
            Topic::ServiceHealthConnect => "service_health_connect",
            Topic::ServiceList => "service_list",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOp {
    Register,
    Deregister,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventPayload {
    /// An instance with its node and checks. Deregistrations carry only
    /// the node name and the instance as it was.
    CheckServiceNode(CheckServiceNode),
    /// A service name.
    ServiceName(String),
}

/// One change, stamped with the write index that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub key: String,
    pub index: u64,
    pub op: CatalogOp,
    pub payload: EventPayload,
}

impl Event {
    pub fn check_service_node(&self) -> Option<&CheckServiceNode> {
        match &self.payload {
            EventPayload::CheckServiceNode(csn) => Some(csn),
            EventPayload::ServiceName(_) => None,
        }
    }

    /// The same event re-keyed onto the connect topic.
    pub(crate) fn to_connect(&self, key: &str) -> Event {
        Event {
            topic: Topic::ServiceHealthConnect,
            key: key.to_string(),
            ..self.clone()
        }
    }
}

/// What arrives on a subscription channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Event { event: Event },
    /// Every snapshot event has been delivered; live events follow.
    EndOfSnapshot { index: u64 },
    /// The subscription was closed; no further events follow.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The store was reset from a snapshot; state must be re-read.
    Reset,
}

/// What to subscribe to.
#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub topic: Topic,
    /// Only events with this key, compared case-insensitively. `None`
    /// receives every key on the topic.
    pub key: Option<String>,
    /// Max buffered events before the subscriber is dropped. `None` uses
    /// the store's configured default.
    pub buffer_size: Option<usize>,
}

impl SubscribeRequest {
    pub fn new(topic: Topic, key: impl Into<String>) -> Self {
        Self {
            topic,
            key: Some(key.into()),
            buffer_size: None,
        }
    }

    /// Every key on `topic`.
    pub fn topic(topic: Topic) -> Self {
        Self {
            topic,
            key: None,
            buffer_size: None,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub(crate) fn matches(&self, event: &Event) -> bool {
        event.topic == self.topic
            && self
                .key
                .as_ref()
                .map_or(true, |key| key.eq_ignore_ascii_case(&event.key))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: Receiver<SubscriptionEvent>,
}

impl Subscription {
    pub fn recv(&self) -> Result<SubscriptionEvent, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<SubscriptionEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SubscriptionEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: Topic, key: &str) -> Event {
        Event {
            topic,
            key: key.into(),
            index: 1,
            op: CatalogOp::Register,
            payload: EventPayload::ServiceName(key.into()),
        }
    }

    #[test]
    fn test_request_matches_key_case_insensitively() {
        let req = SubscribeRequest::new(Topic::ServiceHealth, "Web");
        assert!(req.matches(&event(Topic::ServiceHealth, "web")));
        assert!(!req.matches(&event(Topic::ServiceHealth, "api")));
        assert!(!req.matches(&event(Topic::ServiceHealthConnect, "web")));
    }

    #[test]
    fn test_topic_request_matches_any_key() {
        let req = SubscribeRequest::topic(Topic::ServiceList);
        assert!(req.matches(&event(Topic::ServiceList, "web")));
        assert!(req.matches(&event(Topic::ServiceList, "db")));
    }
}
