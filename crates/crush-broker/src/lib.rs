//! Typed pub/sub broker: fan-out with bounded per-subscriber buffering and
//! synchronous low-latency listeners.
//!
//! One [`Broker<T>`] instance exists per event family (sessions, messages,
//! permission requests, permission notifications, ...). Publish is
//! non-blocking: each subscriber receives from a shared ring buffer and, if
//! it falls behind far enough to overflow the buffer, the broker drops the
//! oldest events for that subscriber rather than blocking the publisher.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default per-subscriber buffer capacity, per §4.A of the spec.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn created(payload: T) -> Self {
        Self { kind: EventKind::Created, payload }
    }

    pub fn updated(payload: T) -> Self {
        Self { kind: EventKind::Updated, payload }
    }

    pub fn deleted(payload: T) -> Self {
        Self { kind: EventKind::Deleted, payload }
    }
}

type Listener<T> = Box<dyn Fn(&Event<T>) + Send + Sync>;

/// A typed fan-out broker for one event family.
///
/// Internally backed by [`tokio::sync::broadcast`], whose lagged-receiver
/// semantics are exactly the "drop oldest for this subscriber, keep a
/// dropped-count" contract the spec asks for: a receiver that falls behind
/// the ring buffer's capacity gets `RecvError::Lagged(n)` on its next poll
/// (the oldest `n` events it missed) and then resumes receiving in order.
pub struct Broker<T: Clone + Send + 'static> {
    tx: broadcast::Sender<Event<T>>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx, listeners: Mutex::new(Vec::new()) }
    }

    /// Publish an event. Never blocks: listeners run synchronously here on
    /// the caller's thread, then the event is broadcast to all live
    /// subscribers (or dropped if there are none).
    pub fn publish(&self, event: Event<T>) {
        {
            let listeners = self.listeners.lock().expect("broker listener lock poisoned");
            for listener in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                    warn!("broker listener panicked; continuing with remaining listeners");
                }
            }
        }
        // No receivers is not a failure for a publisher with no subscribers yet.
        let _ = self.tx.send(event);
    }

    /// Register a synchronous callback invoked on the publisher's thread
    /// for every event, before subscribers are notified. A panicking
    /// listener is isolated and logged; it does not affect other listeners
    /// or the publisher.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Event<T>) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("broker listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Subscribe to future events. Delivery begins from the next publish;
    /// there is no replay of past events.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription { rx: self.tx.subscribe(), dropped: AtomicU64::new(0) }
    }
}

/// A live subscription to a [`Broker`].
pub struct Subscription<T> {
    rx: broadcast::Receiver<Event<T>>,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Total events dropped for this subscriber due to overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Receive the next event, skipping past any lag gaps transparently.
    /// Returns `None` once the broker (all senders) has been dropped.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next event, or `None` if `token` cancels first. The
    /// channel is considered closed (subscriber should stop draining) in
    /// either case.
    pub async fn recv_cancellable(&mut self, token: &CancellationToken) -> Option<Event<T>> {
        tokio::select! {
            _ = token.cancelled() => None,
            event = self.recv() => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_sees_no_replay() {
        let broker: Broker<i32> = Broker::new(DEFAULT_CAPACITY);
        broker.publish(Event::created(1));
        let mut sub = broker.subscribe();
        broker.publish(Event::created(2));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, 2);
    }

    #[tokio::test]
    async fn preserves_publish_order_per_subscriber() {
        let broker: Broker<i32> = Broker::new(DEFAULT_CAPACITY);
        let mut sub = broker.subscribe();
        for i in 0..10 {
            broker.publish(Event::updated(i));
        }
        for i in 0..10 {
            assert_eq!(sub.recv().await.unwrap().payload, i);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let broker: Broker<i32> = Broker::new(4);
        let mut sub = broker.subscribe();
        for i in 0..10 {
            broker.publish(Event::updated(i));
        }
        // The slow subscriber should observe a lag and recover, landing on
        // recent events rather than blocking the publisher.
        let event = sub.recv().await.unwrap();
        assert!(event.payload >= 6, "expected to skip ahead past dropped events");
        assert!(sub.dropped_count() > 0);
    }

    #[tokio::test]
    async fn listener_panic_does_not_break_other_listeners_or_publish() {
        let broker: Broker<i32> = Broker::new(DEFAULT_CAPACITY);
        let mut sub = broker.subscribe();
        broker.add_listener(|_event| panic!("boom"));
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        broker.add_listener(move |_event| {
            seen2.store(true, Ordering::SeqCst);
        });
        broker.publish(Event::created(42));
        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(sub.recv().await.unwrap().payload, 42);
    }

    #[tokio::test]
    async fn recv_cancellable_returns_none_on_cancel() {
        let broker: Broker<i32> = Broker::new(DEFAULT_CAPACITY);
        let mut sub = broker.subscribe();
        let token = CancellationToken::new();
        token.cancel();
        assert!(sub.recv_cancellable(&token).await.is_none());
    }

    #[tokio::test]
    async fn no_subscribers_does_not_panic_publish() {
        let broker: Broker<i32> = Broker::new(DEFAULT_CAPACITY);
        broker.publish(Event::created(1));
    }
}
