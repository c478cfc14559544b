//! Fan-out of derived events to subscribers.

use super::types::{DropReason, Event, SubscribeRequest, Subscription, SubscriptionEvent, SubscriptionId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

struct Subscriber {
    request: SubscribeRequest,
    sender: Sender<SubscriptionEvent>,
}

impl Subscriber {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: SubscriptionEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Holds subscriptions and broadcasts committed events to them.
///
/// Subscribers are never waited on: one whose buffer is full is dropped
/// and must resubscribe, which replays a fresh snapshot.
pub struct EventPublisher {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    default_buffer_size: usize,
}

impl EventPublisher {
    pub fn new(default_buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_buffer_size: default_buffer_size.max(1),
        }
    }

    /// Register a subscription, first queueing `snapshot` followed by an
    /// end-of-snapshot marker at `index`.
    ///
    /// The caller must hold off commits until this returns, or live events
    /// could slip between the snapshot and registration.
    pub(crate) fn subscribe_with_snapshot(
        &self,
        request: SubscribeRequest,
        snapshot: Vec<Event>,
        index: u64,
    ) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let size = request.buffer_size.unwrap_or(self.default_buffer_size).max(1);
        let (sender, receiver) = bounded(size);
        let subscriber = Subscriber { request, sender };

        let queued = snapshot
            .into_iter()
            .map(|event| SubscriptionEvent::Event { event })
            .chain(std::iter::once(SubscriptionEvent::EndOfSnapshot { index }))
            .all(|event| subscriber.try_send(event));

        if queued {
            debug!(id = id.0, topic = %subscriber.request.topic, "subscribed");
            self.subscribers.write().insert(id, subscriber);
        } else {
            warn!(id = id.0, buffer = size, "snapshot overflowed subscription buffer");
            drop(subscriber.sender);
        }
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            let _ = sub.sender.try_send(SubscriptionEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver one commit's events to every matching subscriber, dropping
    /// any that cannot keep up.
    pub fn publish(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut to_remove = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                let delivered = events
                    .iter()
                    .filter(|e| sub.request.matches(e))
                    .all(|e| sub.try_send(SubscriptionEvent::Event { event: e.clone() }));
                if !delivered {
                    to_remove.push(*id);
                }
            }
        }
        self.drop_subscribers(to_remove, DropReason::BufferOverflow);
    }

    /// Close every subscription, e.g. after the state was replaced.
    pub fn reset(&self, reason: DropReason) {
        let ids: Vec<_> = self.subscribers.read().keys().copied().collect();
        self.drop_subscribers(ids, reason);
    }

    fn drop_subscribers(&self, ids: Vec<SubscriptionId>, reason: DropReason) {
        if ids.is_empty() {
            return;
        }
        let mut subs = self.subscribers.write();
        for id in ids {
            if let Some(sub) = subs.remove(&id) {
                warn!(id = id.0, topic = %sub.request.topic, reason = ?reason, "dropping subscriber");
                // Best effort; a full buffer means the receiver sees the
                // channel close instead.
                let _ = sub.sender.try_send(SubscriptionEvent::Dropped {
                    reason: reason.clone(),
                });
            }
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CatalogOp, EventPayload, Topic};
    use std::time::Duration;

    fn event(key: &str) -> Event {
        Event {
            topic: Topic::ServiceList,
            key: key.into(),
            index: 7,
            op: CatalogOp::Register,
            payload: EventPayload::ServiceName(key.into()),
        }
    }

    #[test]
    fn test_snapshot_then_live() {
        let publisher = EventPublisher::new(16);
        let sub = publisher.subscribe_with_snapshot(SubscribeRequest::topic(Topic::ServiceList), vec![event("a")], 5);

        publisher.publish(&[event("b")]);

        let keys: Vec<_> = (0..3)
            .map(|_| sub.recv_timeout(Duration::from_millis(100)).unwrap())
            .map(|e| match e {
                SubscriptionEvent::Event { event } => event.key,
                SubscriptionEvent::EndOfSnapshot { index } => format!("eos@{}", index),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(keys, vec!["a", "eos@5", "b"]);
    }

    #[test]
    fn test_filters_by_key() {
        let publisher = EventPublisher::new(16);
        let sub = publisher.subscribe_with_snapshot(SubscribeRequest::new(Topic::ServiceList, "a"), Vec::new(), 0);
        assert!(matches!(sub.try_recv(), Ok(SubscriptionEvent::EndOfSnapshot { .. })));

        publisher.publish(&[event("b")]);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let publisher = EventPublisher::new(16);
        let sub = publisher.subscribe_with_snapshot(
            SubscribeRequest::topic(Topic::ServiceList).with_buffer_size(2),
            Vec::new(),
            0,
        );
        for i in 0..10 {
            publisher.publish(&[event(&format!("s{}", i))]);
        }
        assert_eq!(publisher.subscriber_count(), 0);
        drop(sub);
    }

    #[test]
    fn test_unsubscribe_sends_dropped() {
        let publisher = EventPublisher::new(16);
        let sub = publisher.subscribe_with_snapshot(SubscribeRequest::topic(Topic::ServiceList), Vec::new(), 0);
        publisher.unsubscribe(sub.id);
        assert_eq!(publisher.subscriber_count(), 0);

        let _eos = sub.recv().unwrap();
        assert!(matches!(
            sub.recv().unwrap(),
            SubscriptionEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_snapshot_overflow_closes_channel() {
        let publisher = EventPublisher::new(16);
        let snapshot = (0..5).map(|i| event(&format!("s{}", i))).collect();
        let sub = publisher.subscribe_with_snapshot(
            SubscribeRequest::topic(Topic::ServiceList).with_buffer_size(2),
            snapshot,
            0,
        );
        assert_eq!(publisher.subscriber_count(), 0);
        let _ = sub.recv();
        let _ = sub.recv();
        assert!(sub.recv().is_err());
    }
}
