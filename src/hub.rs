//! Real-time hub (spec §4.D). Generic over the event type so the same
//! implementation backs both the market-data fan-out hub and the
//! position-event bus (spec §4.E: "published to the position-event bus
//! (implemented as another hub)").

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::DisconnectReason;

pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub fn match_all<T>() -> Predicate<T> {
    Arc::new(|_event: &T| true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    predicate: Predicate<T>,
    disconnect_tx: parking_lot::Mutex<Option<oneshot::Sender<DisconnectReason>>>,
    /// Consecutive broadcasts observed above `slow_threshold_ratio`.
    high_fill_streak: AtomicU32,
}

pub struct Subscription<T> {
    pub handle: SubscriberHandle,
    pub events: mpsc::Receiver<T>,
    pub disconnect: oneshot::Receiver<DisconnectReason>,
}

pub struct Hub<T> {
    queue_size: usize,
    slow_threshold_ratio: f64,
    subscribers: RwLock<HashMap<u64, Arc<Subscriber<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Hub<T> {
    pub fn new(queue_size: usize, slow_threshold_ratio: f64) -> Self {
        Self {
            queue_size: queue_size.max(1),
            slow_threshold_ratio,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, predicate: Predicate<T>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_size);
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let sub = Arc::new(Subscriber {
            tx,
            predicate,
            disconnect_tx: parking_lot::Mutex::new(Some(disconnect_tx)),
            high_fill_streak: AtomicU32::new(0),
        });
        self.subscribers.write().insert(id, sub);
        Subscription {
            handle: SubscriberHandle(id),
            events: rx,
            disconnect: disconnect_rx,
        }
    }

    /// Idempotent: unsubscribing twice, or a handle the hub already
    /// dropped for slowness, is a no-op.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        self.subscribers.write().remove(&handle.0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Non-blocking; delivered at-most-once to each matching subscriber.
    /// Holds only a read-lock over the registry so concurrent broadcasts
    /// fan out in parallel (spec §5).
    pub fn broadcast(&self, event: T) {
        let subs = self.subscribers.read();
        let mut slow = Vec::new();
        for (&id, sub) in subs.iter() {
            if !(sub.predicate)(&event) {
                continue;
            }
            let remaining = sub.tx.capacity() as f64;
            let ratio = 1.0 - (remaining / self.queue_size as f64);
            if ratio > self.slow_threshold_ratio {
                let streak = sub.high_fill_streak.fetch_add(1, Ordering::AcqRel) + 1;
                if streak > 1 {
                    slow.push(id);
                    continue;
                }
            } else {
                sub.high_fill_streak.store(0, Ordering::Release);
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id),
            }
        }
        drop(subs);
        for id in slow {
            self.disconnect(id, DisconnectReason::SlowConsumer);
        }
    }

    fn disconnect(&self, id: u64, reason: DisconnectReason) {
        let removed = self.subscribers.write().remove(&id);
        if let Some(sub) = removed {
            if reason == DisconnectReason::SlowConsumer {
                warn!(subscriber_id = id, "disconnecting slow consumer");
            }
            if let Some(tx) = sub.disconnect_tx.lock().take() {
                let _ = tx.send(reason);
            }
        }
    }

    /// Disconnects every current subscriber with `SHUTDOWN`, used by the
    /// supervisor during graceful shutdown.
    pub fn shutdown_all(&self) {
        let ids: Vec<u64> = self.subscribers.read().keys().copied().collect();
        for id in ids {
            self.disconnect(id, DisconnectReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_predicate_receives_event() {
        let hub: Hub<u32> = Hub::new(4, 0.9);
        let mut sub = hub.subscribe(match_all());
        hub.broadcast(42);
        assert_eq!(sub.events.recv().await, Some(42));
    }

    #[tokio::test]
    async fn non_matching_predicate_is_skipped() {
        let hub: Hub<u32> = Hub::new(4, 0.9);
        let mut sub = hub.subscribe(Arc::new(|v: &u32| *v > 100));
        hub.broadcast(1);
        hub.broadcast(200);
        assert_eq!(sub.events.recv().await, Some(200));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub: Hub<u32> = Hub::new(4, 0.9);
        let sub = hub.subscribe(match_all());
        hub.unsubscribe(sub.handle);
        hub.unsubscribe(sub.handle);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_with_reason() {
        let hub: Hub<u32> = Hub::new(2, 0.5);
        let mut sub = hub.subscribe(match_all());
        // Fill past the threshold twice without draining to trigger the
        // consecutive-streak disconnect.
        for i in 0..10u32 {
            hub.broadcast(i);
        }
        let reason = sub.disconnect.try_recv();
        assert_eq!(reason, Ok(DisconnectReason::SlowConsumer));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn fast_subscriber_never_loses_events_under_capacity() {
        let hub: Hub<u32> = Hub::new(64, 0.9);
        let mut sub = hub.subscribe(match_all());
        for i in 0..50u32 {
            hub.broadcast(i);
        }
        let mut received = Vec::new();
        while let Ok(v) = sub.events.try_recv() {
            received.push(v);
        }
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }
}
