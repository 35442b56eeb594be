//! Ordered bar store (spec §4.B). Per-(instrument, timeframe) bounded
//! ring of bars, mutated under a per-key lock rather than a global
//! mutex (spec §5) so distinct instruments never contend with one
//! another.

use crate::model::{Bar, InstrumentKey, Timeframe};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Key = (InstrumentKey, Timeframe);
type Shard = Arc<Mutex<VecDeque<Bar>>>;

pub struct BarStore {
    ring_size: usize,
    shards: RwLock<HashMap<Key, Shard>>,
}

impl BarStore {
    pub fn new(ring_size: usize) -> Self {
        Self {
            ring_size: ring_size.max(1),
            shards: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, ik: &InstrumentKey, tf: Timeframe) -> Shard {
        let key = (ik.clone(), tf);
        if let Some(shard) = self.shards.read().get(&key) {
            return shard.clone();
        }
        self.shards
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.ring_size))))
            .clone()
    }

    /// Returns the rightmost bar if it is not closed, else `None`.
    pub fn open_bar(&self, ik: &InstrumentKey, tf: Timeframe) -> Option<Bar> {
        let shard = self.shard(ik, tf);
        let guard = shard.lock();
        guard.back().filter(|b| b.is_open()).cloned()
    }

    /// Appends a new bar, evicting the oldest if the ring is full.
    pub fn append(&self, ik: &InstrumentKey, tf: Timeframe, bar: Bar) {
        let shard = self.shard(ik, tf);
        let mut guard = shard.lock();
        if guard.len() >= self.ring_size {
            guard.pop_front();
        }
        guard.push_back(bar);
    }

    /// Replaces the current rightmost (open) bar in place, or appends if
    /// none exists yet. Used for in-place OHLCV mutation of the open bar.
    pub fn replace_open(&self, ik: &InstrumentKey, tf: Timeframe, bar: Bar) {
        let shard = self.shard(ik, tf);
        let mut guard = shard.lock();
        match guard.back_mut() {
            Some(last) if last.is_open() => *last = bar,
            _ => {
                if guard.len() >= self.ring_size {
                    guard.pop_front();
                }
                guard.push_back(bar);
            }
        }
    }

    /// Last `limit` bars (closed plus the open one if present), oldest
    /// first. Returns copies, never a view into the shard.
    pub fn snapshot(&self, ik: &InstrumentKey, tf: Timeframe, limit: usize) -> Vec<Bar> {
        let shard = self.shard(ik, tf);
        let guard = shard.lock();
        let len = guard.len();
        let skip = len.saturating_sub(limit);
        guard.iter().skip(skip).cloned().collect()
    }

    /// All (instrument, timeframe) keys currently tracked. Used by the
    /// aggregator's periodic `flush()` to find bars whose bucket has
    /// elapsed without a new tick arriving to close them.
    pub fn keys(&self) -> Vec<Key> {
        self.shards.read().keys().cloned().collect()
    }
}
