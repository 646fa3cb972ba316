//! Fan-out of cluster deltas to every connected dashboard client.
//!
//! The hub owns a set of [`Subscription`]s, one per connection. Each has a
//! bounded conduit; [`BroadcastHub::publish`] never waits on a subscriber and
//! instead applies the hub's [`SlowConsumerPolicy`] when a conduit is full.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ClientMessage;

/// Default number of messages buffered per subscription.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// What to do with a subscriber whose buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowConsumerPolicy {
    /// Remove the subscription; its connection sees the conduit close.
    #[default]
    Disconnect,
    /// Skip the message for that subscriber only.
    DropMessage,
}

/// Registration handle for one connection's delivery conduit.
///
/// Registering moves the sending half into the hub, so once the hub drops a
/// subscription its receiver observes the conduit closing.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    tx: Option<mpsc::Sender<Arc<ClientMessage>>>,
}

impl Subscription {
    /// Create a subscription and the receiving end of its conduit.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<ClientMessage>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// Unique subscription ID.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Process-wide set of active subscriptions.
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<ClientMessage>>>>,
    capacity: usize,
    policy: SlowConsumerPolicy,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER, SlowConsumerPolicy::default())
    }
}

impl BroadcastHub {
    /// Create a hub whose subscriptions buffer `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize, policy: SlowConsumerPolicy) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity,
            policy,
        }
    }

    /// Create a subscription sized for this hub and register it.
    pub fn subscribe(&self) -> (Subscription, mpsc::Receiver<Arc<ClientMessage>>) {
        let (mut subscription, rx) = Subscription::new(self.capacity);
        self.register(&mut subscription);
        (subscription, rx)
    }

    /// Register a subscription. Registering twice is a no-op, as is
    /// registering one the hub has already dropped.
    pub fn register(&self, subscription: &mut Subscription) {
        let Some(tx) = subscription.tx.take() else {
            return;
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.insert(subscription.id, tx);
        debug!(subscription = %subscription.id, total = subscribers.len(), "subscription registered");
    }

    /// Remove a subscription. Unknown subscriptions are ignored.
    pub fn unregister(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.remove(&subscription.id).is_some() {
            debug!(subscription = %subscription.id, total = subscribers.len(), "subscription removed");
        }
    }

    /// Whether a subscription is currently registered.
    #[must_use]
    pub fn is_registered(&self, subscription: &Subscription) -> bool {
        self.subscribers.lock().contains_key(&subscription.id)
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver a message to every registered subscription.
    ///
    /// Returns the number of subscriptions that accepted it.
    pub fn publish(&self, message: Arc<ClientMessage>) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;

        subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscription = %id, "pruning closed subscription");
                false
            }
            Err(TrySendError::Full(_)) => match self.policy {
                SlowConsumerPolicy::Disconnect => {
                    warn!(subscription = %id, "subscriber buffer full, disconnecting");
                    false
                }
                SlowConsumerPolicy::DropMessage => {
                    warn!(
                        subscription = %id,
                        cluster = %message.cluster_id(),
                        "subscriber buffer full, dropping message"
                    );
                    true
                }
            },
        });

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::pod;
    use crate::types::{ClusterId, DeltaRecord};

    fn delta(name: &str) -> Arc<ClientMessage> {
        Arc::new(ClientMessage::ClusterDelta(DeltaRecord::upsert(
            ClusterId::new("c1"),
            pod("ns", name, Some("n1")),
        )))
    }

    fn name_of(message: &ClientMessage) -> String {
        match message {
            ClientMessage::ClusterDelta(record) => record.path.segments()[3].to_string(),
            ClientMessage::ClusterUpdate(snapshot) => snapshot.id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let hub = BroadcastHub::default();
        let (_a, mut rx_a) = hub.subscribe();
        let (_b, mut rx_b) = hub.subscribe();

        let message = delta("web");
        assert_eq!(hub.publish(message.clone()), 2);

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&got_a, &message));
        assert!(Arc::ptr_eq(&got_b, &message));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_delivery_before_register_or_after_unregister() {
        let hub = BroadcastHub::default();
        let (mut subscription, mut rx) = Subscription::new(8);

        assert_eq!(hub.publish(delta("before")), 0);

        hub.register(&mut subscription);
        assert_eq!(hub.publish(delta("during")), 1);

        hub.unregister(&subscription);
        assert_eq!(hub.publish(delta("after")), 0);

        let received = rx.recv().await.unwrap();
        assert_eq!(name_of(&received), "ns/during");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let hub = BroadcastHub::default();
        let (mut subscription, _rx) = Subscription::new(8);

        hub.register(&mut subscription);
        hub.register(&mut subscription);

        assert_eq!(hub.subscriber_count(), 1);
        assert!(hub.is_registered(&subscription));
    }

    #[test]
    fn test_unregister_unknown_is_safe() {
        let hub = BroadcastHub::default();
        let (subscription, _rx) = Subscription::new(8);

        hub.unregister(&subscription);

        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let hub = BroadcastHub::default();
        let (_subscription, mut rx) = hub.subscribe();

        for name in ["a", "b", "c"] {
            hub.publish(delta(name));
        }

        for expected in ["ns/a", "ns/b", "ns/c"] {
            assert_eq!(name_of(&rx.recv().await.unwrap()), expected);
        }
    }

    #[test]
    fn test_slow_consumer_disconnected() {
        let hub = BroadcastHub::new(1, SlowConsumerPolicy::Disconnect);
        let (slow, _slow_rx) = hub.subscribe();
        let (_fast, mut fast_rx) = hub.subscribe();

        assert_eq!(hub.publish(delta("a")), 2);
        fast_rx.try_recv().unwrap();

        // The slow subscriber never drained "a".
        assert_eq!(hub.publish(delta("b")), 1);
        assert!(!hub.is_registered(&slow));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_sees_conduit_close() {
        let hub = BroadcastHub::new(1, SlowConsumerPolicy::Disconnect);
        let (mut slow, mut slow_rx) = hub.subscribe();

        hub.publish(delta("a"));
        hub.publish(delta("b"));
        assert!(!hub.is_registered(&slow));

        assert_eq!(name_of(&slow_rx.recv().await.unwrap()), "ns/a");
        assert!(slow_rx.recv().await.is_none());

        // The dropped subscription cannot come back.
        hub.register(&mut slow);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_slow_consumer_drop_message() {
        let hub = BroadcastHub::new(1, SlowConsumerPolicy::DropMessage);
        let (slow, mut slow_rx) = hub.subscribe();

        assert_eq!(hub.publish(delta("a")), 1);
        assert_eq!(hub.publish(delta("b")), 0);

        assert!(hub.is_registered(&slow));
        assert_eq!(name_of(&slow_rx.try_recv().unwrap()), "ns/a");
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscription_pruned() {
        let hub = BroadcastHub::default();
        let (subscription, rx) = hub.subscribe();
        drop(rx);

        assert_eq!(hub.publish(delta("a")), 0);
        assert!(!hub.is_registered(&subscription));
    }
}
