// ABOUTME: Typed publish/subscribe bus used for transport and connection lifecycle events.
// ABOUTME: Subscriptions unsubscribe explicitly or when dropped, so shutdown leaves no dangling listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

type Subscribers<T> = Vec<(u64, mpsc::UnboundedSender<T>)>;

struct BusInner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers<T>>,
}

impl<T> BusInner<T> {
    fn subscribers(&self) -> MutexGuard<'_, Subscribers<T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fan-out bus delivering every published event to every live subscriber.
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new listener. Events published before this call are not replayed.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to all subscribers, returning how many received it.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.inner.subscribers();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one listener on an [`EventBus`].
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    bus: Weak<BusInner<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event. Returns `None` once unsubscribed or the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Detach from the bus. Events already queued are discarded.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish("connected".to_string()), 2);
        assert_eq!(first.recv().await.as_deref(), Some("connected"));
        assert_eq!(second.recv().await.as_deref(), Some("connected"));
    }

    #[test]
    fn test_unsubscribe_removes_listener() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe();
        let _other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(7), 1);
    }

    #[test]
    fn test_subscription_outliving_bus_is_harmless() {
        let bus: EventBus<u32> = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(1);
        drop(bus);
        assert_eq!(sub.try_recv(), Some(1));
        assert_eq!(sub.try_recv(), None);
    }
}
