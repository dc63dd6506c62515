//! Actor-style publish/subscribe bus.
//!
//! One task owns the subscriber table. Subscribing, unsubscribing, publishing
//! and closing are all messages into that task's inbox, so they are applied in
//! the exact order they were issued and no lock is shared between publishers
//! and subscribers.
//!
//! ```text
//! ┌───────────┐  Publish(e)   ┌──────────────┐   e.clone()  ┌──────────────┐
//! │ Publisher │ ────────────► │  bus actor   │ ───────────► │ Subscription │
//! └───────────┘               │              │              └──────────────┘
//! ┌───────────┐  Subscribe    │ subscribers: │   e.clone()  ┌──────────────┐
//! │ EventBus  │ ────────────► │ Vec<(id,tx)> │ ───────────► │ Subscription │
//! └───────────┘               └──────────────┘              └──────────────┘
//! ```
//!
//! A subscription observes exactly the events published after its
//! `subscribe` call and before its `unsubscribe`/drop. Each subscriber owns
//! an unbounded FIFO; publishing never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

enum BusMessage<E> {
    Subscribe {
        id: u64,
        tx: mpsc::UnboundedSender<E>,
    },
    Unsubscribe {
        id: u64,
    },
    Publish(E),
    Close,
}

/// Owner handle of a bus.
///
/// Dropping the `EventBus` closes it: every subscription then drains what it
/// already received and returns `None`.
pub struct EventBus<E> {
    name: &'static str,
    inbox: mpsc::UnboundedSender<BusMessage<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    /// Spawn the bus actor on the current tokio runtime.
    ///
    /// `name` only appears in traces.
    pub fn new(name: &'static str) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_bus(name, rx));
        Self {
            name,
            inbox,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cloneable handle that can only publish.
    pub fn publisher(&self) -> Publisher<E> {
        Publisher {
            inbox: self.inbox.clone(),
            next_id: self.next_id.clone(),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<E> {
        subscribe(&self.inbox, &self.next_id)
    }

    /// Publish an event to every current subscriber. No-op once closed.
    pub fn publish(&self, event: E) {
        let _ = self.inbox.send(BusMessage::Publish(event));
    }

    /// Close the bus, dropping every subscriber. Idempotent.
    pub fn close(&self) {
        if self.inbox.send(BusMessage::Close).is_ok() {
            trace!(bus = self.name, "close requested");
        }
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

impl<E> Drop for EventBus<E> {
    fn drop(&mut self) {
        let _ = self.inbox.send(BusMessage::Close);
    }
}

/// Publishing side of a bus, handed to workers.
pub struct Publisher<E> {
    inbox: mpsc::UnboundedSender<BusMessage<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Publisher<E>
where
    E: Clone + Send + 'static,
{
    /// Publish an event. No-op once the bus is closed.
    pub fn publish(&self, event: E) {
        let _ = self.inbox.send(BusMessage::Publish(event));
    }

    /// Register a new subscriber on the same bus.
    pub fn subscribe(&self) -> Subscription<E> {
        subscribe(&self.inbox, &self.next_id)
    }

    /// Whether the bus has stopped.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

/// Receiving side of one subscriber.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    inbox: mpsc::UnboundedSender<BusMessage<E>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus is closed (or this subscription was
    /// unsubscribed) and every queued event has been consumed.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Events already queued stay readable.
    pub fn unsubscribe(&mut self) {
        let _ = self.inbox.send(BusMessage::Unsubscribe { id: self.id });
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        let _ = self.inbox.send(BusMessage::Unsubscribe { id: self.id });
    }
}

fn subscribe<E>(
    inbox: &mpsc::UnboundedSender<BusMessage<E>>,
    next_id: &AtomicU64,
) -> Subscription<E> {
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    // If the bus is already closed `tx` is dropped here and `recv` yields None.
    let _ = inbox.send(BusMessage::Subscribe { id, tx });
    Subscription {
        id,
        rx,
        inbox: inbox.clone(),
    }
}

async fn run_bus<E: Clone>(name: &'static str, mut inbox: mpsc::UnboundedReceiver<BusMessage<E>>) {
    let mut subscribers: Vec<(u64, mpsc::UnboundedSender<E>)> = Vec::new();

    while let Some(message) = inbox.recv().await {
        match message {
            BusMessage::Subscribe { id, tx } => subscribers.push((id, tx)),
            BusMessage::Unsubscribe { id } => subscribers.retain(|(sid, _)| *sid != id),
            BusMessage::Publish(event) => {
                subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            }
            BusMessage::Close => break,
        }
    }

    inbox.close();
    trace!(bus = name, subscribers = subscribers.len(), "bus closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(sub: &mut Subscription<u32>) -> Option<u32> {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timed out")
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::new("test");
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for i in 0..5 {
            bus.publish(i);
        }

        for i in 0..5 {
            assert_eq!(next(&mut a).await, Some(i));
            assert_eq!(next(&mut b).await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new("test");
        let publisher = bus.publisher();
        let mut early = bus.subscribe();

        publisher.publish(1);
        let mut late = publisher.subscribe();
        publisher.publish(2);

        assert_eq!(next(&mut early).await, Some(1));
        assert_eq!(next(&mut early).await, Some(2));
        assert_eq!(next(&mut late).await, Some(2));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new("test");
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1);
        a.unsubscribe();
        bus.publish(2);

        assert_eq!(next(&mut a).await, Some(1));
        assert_eq!(next(&mut a).await, None);
        assert_eq!(next(&mut b).await, Some(1));
        assert_eq!(next(&mut b).await, Some(2));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new("test");
        let publisher = bus.publisher();
        let mut sub = bus.subscribe();

        publisher.publish(7);
        bus.close();
        bus.close();
        publisher.publish(8);

        assert_eq!(next(&mut sub).await, Some(7));
        assert_eq!(next(&mut sub).await, None);

        let mut after = publisher.subscribe();
        assert_eq!(next(&mut after).await, None);
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_owner_closes_bus() {
        let bus = EventBus::<u32>::new("test");
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(next(&mut sub).await, None);
    }
}
