//! Typed publish/subscribe registry with per-subscriber isolation.
//!
//! Event delivery is fire-and-forget: each handler runs on its own tokio
//! task with panic containment, so one bad subscriber can never affect
//! delivery to the others or stall the publisher. Publishing never blocks
//! on subscriber work.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

type Handler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Token identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Multi-subscriber event registry for events of type `E`.
///
/// Cloning the bus is cheap and shares the subscriber registry.
pub struct EventBus<E> {
    handlers: Arc<RwLock<HashMap<u64, Handler<E>>>>,
    next_id: Arc<AtomicU64>,
    /// Short name used in dispatch failure logs.
    name: &'static str,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            next_id: Arc::clone(&self.next_id),
            name: self.name,
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create an empty bus. `name` appears in dispatch failure logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            name,
        }
    }

    /// Register a handler. The handler must not block; long work should be
    /// handed off to a queue or task of its own.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(id, Arc::new(handler));
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.write().remove(&id.0);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver `event` to every subscriber, each on its own task.
    ///
    /// A panicking handler is logged and contained; it neither reaches the
    /// publisher nor the remaining subscribers.
    pub fn publish(&self, event: &E) {
        // Snapshot under the read lock so handlers may subscribe/unsubscribe
        // from within their own callback without deadlocking.
        let snapshot: Vec<(u64, Handler<E>)> = self
            .handlers
            .read()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        for (id, handler) in snapshot {
            let event = event.clone();
            let bus_name = self.name;
            tokio::spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    error!(bus = bus_name, subscriber = id, "event handler panicked");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus: EventBus<u32> = EventBus::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |v| {
            let _ = tx.send(v);
        });

        bus.publish(&7);
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_affect_others() {
        let bus: EventBus<u32> = EventBus::new("test");
        bus.subscribe(|_| panic!("bad subscriber"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |v| {
            let _ = tx.send(v);
        });

        bus.publish(&1);
        bus.publish(&2);

        let a = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let b = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(2));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(move |v| {
            let _ = tx.send(v);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(&9);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
