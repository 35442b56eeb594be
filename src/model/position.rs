//! Position snapshot and position event (spec §3, §4.E).

use super::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};

/// Broker-reported state of a net position at an instant. Sign of
/// `net_quantity` encodes direction: positive long, negative short,
/// zero flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub account_id: String,
    pub instrument_key: InstrumentKey,
    pub net_quantity: i64,
    pub average_entry_price: i64,
    pub realized_pnl: i64,
    /// Monotonic per account; stale snapshots (`source_sequence <= stored`)
    /// are ignored by the tracker.
    pub source_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEventKind {
    Opened,
    Increased,
    Reduced,
    Closed,
    Flipped,
}

/// Derived transition between two snapshots. Emitted exactly when the
/// tracker observes a change (spec §4.E).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub account_id: String,
    pub instrument_key: InstrumentKey,
    pub kind: PositionEventKind,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub observed_at: i64,
}

/// Classifies a quantity transition per the rules in spec §4.E. Returns
/// `None` when `prev == new` (no event).
pub fn classify_transition(prev: i64, new: i64) -> Option<PositionEventKind> {
    if prev == new {
        return None;
    }
    if prev == 0 && new != 0 {
        return Some(PositionEventKind::Opened);
    }
    if prev != 0 && new == 0 {
        return Some(PositionEventKind::Closed);
    }
    let same_sign = prev.signum() == new.signum();
    if same_sign {
        if new.abs() > prev.abs() {
            Some(PositionEventKind::Increased)
        } else {
            Some(PositionEventKind::Reduced)
        }
    } else {
        Some(PositionEventKind::Flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_scenario_sequence() {
        assert_eq!(classify_transition(0, 10), Some(PositionEventKind::Opened));
        assert_eq!(classify_transition(10, 6), Some(PositionEventKind::Reduced));
        assert_eq!(classify_transition(6, 0), Some(PositionEventKind::Closed));
    }

    #[test]
    fn flip_across_zero_crossing_sign() {
        assert_eq!(classify_transition(10, -5), Some(PositionEventKind::Flipped));
    }

    #[test]
    fn no_change_emits_nothing() {
        assert_eq!(classify_transition(10, 10), None);
    }

    #[test]
    fn increase_same_sign() {
        assert_eq!(classify_transition(-5, -10), Some(PositionEventKind::Increased));
    }

    proptest::proptest! {
        // spec.md §8 property 6: every ordered pair of snapshots must
        // classify into exactly the event predicted by the §4.E rules,
        // across all sign/magnitude combinations.
        #[test]
        fn classification_matches_spec_rules(prev in -50i64..=50, new in -50i64..=50) {
            let got = classify_transition(prev, new);
            let expected = if prev == new {
                None
            } else if prev == 0 {
                Some(PositionEventKind::Opened)
            } else if new == 0 {
                Some(PositionEventKind::Closed)
            } else if prev.signum() != new.signum() {
                Some(PositionEventKind::Flipped)
            } else if new.abs() > prev.abs() {
                Some(PositionEventKind::Increased)
            } else {
                Some(PositionEventKind::Reduced)
            };
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn classification_is_symmetric_under_negation(prev in -50i64..=50, new in -50i64..=50) {
            // Direction (long/short) is carried only by sign; negating
            // both quantities must not change the emitted event kind.
            prop_assert_eq!(classify_transition(prev, new), classify_transition(-prev, -new));
        }
    }
}
