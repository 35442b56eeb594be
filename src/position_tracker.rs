//! Position tracker (spec §4.E). Consumes position snapshots per
//! account, diffs against last known state, and emits OPENED/INCREASED/
//! REDUCED/CLOSED/FLIPPED events onto the position-event bus (itself a
//! [`Hub`]).
//!
//! Reconnect reconciliation (spec §4.E: "treating the first snapshot per
//! (account, instrument) as ground truth") requires no special-cased
//! code: the stored "last known" state already persists across upstream
//! disconnects, so the first post-reconnect snapshot is compared against
//! it by the same rules as any other snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::hub::Hub;
use crate::model::{classify_transition, PositionEvent, PositionSnapshot};

type Key = (String, crate::model::InstrumentKey);

pub struct PositionTracker {
    last: RwLock<HashMap<Key, PositionSnapshot>>,
    event_bus: Arc<Hub<PositionEvent>>,
}

impl PositionTracker {
    pub fn new(event_bus: Arc<Hub<PositionEvent>>) -> Self {
        Self { last: RwLock::new(HashMap::new()), event_bus }
    }

    /// Ingests a new snapshot. Stale snapshots (`source_sequence <=
    /// stored`) are ignored, preserving idempotence against re-delivery.
    pub fn observe(&self, snapshot: PositionSnapshot) {
        let key = (snapshot.account_id.clone(), snapshot.instrument_key.clone());

        let prev = {
            let map = self.last.read();
            map.get(&key).cloned()
        };
        if let Some(prev) = &prev {
            if snapshot.source_sequence <= prev.source_sequence {
                return;
            }
        }

        let prev_qty = prev.as_ref().map(|p| p.net_quantity).unwrap_or(0);
        let new_qty = snapshot.net_quantity;
        let kind = classify_transition(prev_qty, new_qty);

        self.last.write().insert(key, snapshot.clone());

        if let Some(kind) = kind {
            self.event_bus.broadcast(PositionEvent {
                account_id: snapshot.account_id,
                instrument_key: snapshot.instrument_key,
                kind,
                previous_quantity: prev_qty,
                new_quantity: new_qty,
                observed_at: snapshot_observed_at(),
            });
        }
    }

    pub fn last_known(&self, account_id: &str, instrument_key: &crate::model::InstrumentKey) -> Option<PositionSnapshot> {
        self.last.read().get(&(account_id.to_string(), instrument_key.clone())).cloned()
    }
}

fn snapshot_observed_at() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::match_all;
    use crate::model::{InstrumentKey, PositionEventKind};

    fn ik() -> InstrumentKey {
        InstrumentKey::Equity { symbol: "I1".into() }
    }

    fn snap(seq: u64, qty: i64) -> PositionSnapshot {
        PositionSnapshot {
            account_id: "A1".into(),
            instrument_key: ik(),
            net_quantity: qty,
            average_entry_price: 0,
            realized_pnl: 0,
            source_sequence: seq,
        }
    }

    #[tokio::test]
    async fn s3_emits_opened_reduced_closed_in_order() {
        let bus = Arc::new(Hub::new(16, 0.9));
        let mut sub = bus.subscribe(match_all());
        let tracker = PositionTracker::new(bus);

        tracker.observe(snap(1, 10));
        tracker.observe(snap(2, 6));
        tracker.observe(snap(3, 0));

        let e1 = sub.events.recv().await.unwrap();
        assert_eq!(e1.kind, PositionEventKind::Opened);
        let e2 = sub.events.recv().await.unwrap();
        assert_eq!(e2.kind, PositionEventKind::Reduced);
        let e3 = sub.events.recv().await.unwrap();
        assert_eq!(e3.kind, PositionEventKind::Closed);
    }

    #[tokio::test]
    async fn stale_sequence_is_ignored() {
        let bus = Arc::new(Hub::new(16, 0.9));
        let mut sub = bus.subscribe(match_all());
        let tracker = PositionTracker::new(bus);

        tracker.observe(snap(5, 10));
        let _ = sub.events.recv().await.unwrap();
        tracker.observe(snap(3, 999)); // stale, must be ignored
        assert!(sub.events.try_recv().is_err());
        assert_eq!(tracker.last_known("A1", &ik()).unwrap().net_quantity, 10);
    }

    #[tokio::test]
    async fn reconnect_reconciliation_uses_stored_state_as_baseline() {
        let bus = Arc::new(Hub::new(16, 0.9));
        let mut sub = bus.subscribe(match_all());
        let tracker = PositionTracker::new(bus);

        tracker.observe(snap(1, 10));
        let _ = sub.events.recv().await.unwrap();

        // Simulate a reconnect gap: next snapshot observed has advanced
        // sequence and a smaller quantity. No special-case code needed.
        tracker.observe(snap(9, 4));
        let e = sub.events.recv().await.unwrap();
        assert_eq!(e.kind, PositionEventKind::Reduced);
        assert_eq!(e.previous_quantity, 10);
        assert_eq!(e.new_quantity, 4);
    }
}
