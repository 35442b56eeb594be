//! F&O aggregator (spec §4.C). Consumes ticks, updates open bars across
//! all configured timeframes, flushes closed bars to persistence, and
//! emits fan-out events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bar_store::BarStore;
use crate::bucket::bucket_start;
use crate::errors::IngestError;
use crate::hub::Hub;
use crate::model::{Bar, InstrumentKey, Timeframe, Tick, WsEvent};

/// Out-of-order tolerance before a tick is rejected as stale (spec §4.C).
const STALE_GRACE_MS: i64 = 2_000;
/// The aggregator yields every this many ticks to keep other runnables
/// fed on the shared scheduler (spec §5).
const YIELD_EVERY: u64 = 1_000;

pub struct AggregatorConfig {
    pub timeframes: Vec<Timeframe>,
    pub persistence_high_water: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeframes: Timeframe::default_set(),
            persistence_high_water: 10_000,
        }
    }
}

#[derive(Default)]
pub struct AggregatorMetrics {
    pub ticks_ingested: AtomicU64,
    pub rejected_stale: AtomicU64,
    pub rejected_invalid: AtomicU64,
    pub bar_updates_shed: AtomicU64,
    pub bars_closed: AtomicU64,
}

enum VolumeUpdate {
    Add(u64),
    SetMax(u64),
}

pub struct Aggregator {
    config: AggregatorConfig,
    store: Arc<BarStore>,
    hub: Arc<Hub<WsEvent>>,
    persistence_tx: mpsc::UnboundedSender<Bar>,
    persistence_depth: Arc<AtomicUsize>,
    last_cumulative_volume: RwLock<HashMap<InstrumentKey, u64>>,
    pub metrics: Arc<AggregatorMetrics>,
    tick_counter: AtomicU64,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        store: Arc<BarStore>,
        hub: Arc<Hub<WsEvent>>,
        persistence_tx: mpsc::UnboundedSender<Bar>,
        persistence_depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            persistence_tx,
            persistence_depth,
            last_cumulative_volume: RwLock::new(HashMap::new()),
            metrics: Arc::new(AggregatorMetrics::default()),
            tick_counter: AtomicU64::new(0),
        }
    }

    fn backpressured(&self) -> bool {
        self.persistence_depth.load(Ordering::Acquire) > self.config.persistence_high_water
    }

    fn enqueue_persist(&self, bar: Bar) {
        self.persistence_depth.fetch_add(1, Ordering::AcqRel);
        // Closed bars are never shed; an unbounded channel guarantees
        // this send never blocks ingestion and never fails for
        // capacity reasons (spec §4.C, §5).
        if self.persistence_tx.send(bar).is_err() {
            warn!("persistence worker channel closed; bar will be lost");
        }
    }

    fn volume_update(&self, ik: &InstrumentKey, tick: &Tick) -> VolumeUpdate {
        let mut map = self.last_cumulative_volume.write();
        let prior = *map.get(ik).unwrap_or(&tick.cumulative_volume);
        map.insert(ik.clone(), tick.cumulative_volume);
        if tick.last_traded_quantity > 0 {
            VolumeUpdate::Add(tick.last_traded_quantity)
        } else {
            VolumeUpdate::SetMax(tick.cumulative_volume.saturating_sub(prior))
        }
    }

    /// Fails with `REJECTED_STALE`/`REJECTED_INVALID` per spec §4.C.
    pub async fn ingest(&self, tick: Tick) -> Result<(), IngestError> {
        tick.validate().map_err(|e| {
            self.metrics.rejected_invalid.fetch_add(1, Ordering::Relaxed);
            IngestError::RejectedInvalid(e)
        })?;

        // Staleness check across every configured timeframe happens
        // before any mutation, so a stale tick is rejected atomically
        // rather than partially applied.
        for &tf in &self.config.timeframes {
            if let Some(open) = self.store.open_bar(&tick.instrument_key, tf) {
                if tick.timestamp_ms < open.bucket_start - STALE_GRACE_MS {
                    self.metrics.rejected_stale.fetch_add(1, Ordering::Relaxed);
                    return Err(IngestError::RejectedStale);
                }
            }
        }

        let volume_update = self.volume_update(&tick.instrument_key, &tick);
        for &tf in &self.config.timeframes {
            self.apply_timeframe(&tick, tf, &volume_update);
        }

        self.metrics.ticks_ingested.fetch_add(1, Ordering::Relaxed);
        let n = self.tick_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn apply_timeframe(&self, tick: &Tick, tf: Timeframe, volume_update: &VolumeUpdate) {
        let b = bucket_start(tick.timestamp_ms, tf);
        let existing = self.store.open_bar(&tick.instrument_key, tf);
        match existing {
            Some(mut bar) if b > bar.bucket_start => {
                self.close_bar(&mut bar);
                self.store.replace_open(&tick.instrument_key, tf, bar.clone());
                self.enqueue_persist(bar.clone());
                self.broadcast_closed(&tick.instrument_key, tf, bar);

                let new_bar = self.new_bar(tick, tf, b);
                self.store.append(&tick.instrument_key, tf, new_bar.clone());
                self.broadcast_update_if_m1(&tick.instrument_key, tf, new_bar);
            }
            Some(mut bar) => {
                self.update_bar(&mut bar, tick, volume_update);
                self.store.replace_open(&tick.instrument_key, tf, bar.clone());
                self.broadcast_update_if_m1(&tick.instrument_key, tf, bar);
            }
            None => {
                let new_bar = self.new_bar(tick, tf, b);
                self.store.append(&tick.instrument_key, tf, new_bar.clone());
                self.broadcast_update_if_m1(&tick.instrument_key, tf, new_bar);
            }
        }
    }

    fn new_bar(&self, tick: &Tick, tf: Timeframe, bucket_start: i64) -> Bar {
        Bar {
            instrument_key: tick.instrument_key.clone(),
            timeframe: tf,
            bucket_start,
            open: tick.last_traded_price,
            high: tick.last_traded_price,
            low: tick.last_traded_price,
            close: tick.last_traded_price,
            volume: tick.last_traded_quantity,
            open_interest_last: tick.open_interest,
            tick_count: 1,
            closed_at: None,
        }
    }

    fn update_bar(&self, bar: &mut Bar, tick: &Tick, volume_update: &VolumeUpdate) {
        bar.high = bar.high.max(tick.last_traded_price);
        bar.low = bar.low.min(tick.last_traded_price);
        bar.close = tick.last_traded_price;
        bar.volume = match volume_update {
            VolumeUpdate::Add(n) => bar.volume + n,
            VolumeUpdate::SetMax(n) => bar.volume.max(*n),
        };
        bar.open_interest_last = tick.open_interest;
        bar.tick_count += 1;
    }

    fn close_bar(&self, bar: &mut Bar) {
        bar.closed_at = Some(now_ms());
        self.metrics.bars_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn broadcast_closed(&self, ik: &InstrumentKey, tf: Timeframe, bar: Bar) {
        // Closed-bar events are never shed, regardless of backpressure.
        self.hub.broadcast(WsEvent::BarClosed {
            instrument_key: ik.clone(),
            timeframe: tf,
            payload: bar,
        });
    }

    fn broadcast_update_if_m1(&self, ik: &InstrumentKey, tf: Timeframe, bar: Bar) {
        if tf != Timeframe::M1 {
            return;
        }
        if self.backpressured() {
            self.metrics.bar_updates_shed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.hub.broadcast(WsEvent::BarUpdate {
            instrument_key: ik.clone(),
            timeframe: tf,
            payload: bar,
        });
    }

    /// Forcibly closes and persists all open bars whose bucket end has
    /// passed. Non-blocking for ingestion — run on its own supervised
    /// periodic task.
    pub fn flush(&self, now_ms: i64) {
        for (ik, tf) in self.store.keys() {
            if let Some(mut bar) = self.store.open_bar(&ik, tf) {
                let bucket_end = bar.bucket_start + tf.bucket_millis();
                if now_ms >= bucket_end {
                    bar.closed_at = Some(now_ms);
                    self.metrics.bars_closed.fetch_add(1, Ordering::Relaxed);
                    self.store.replace_open(&ik, tf, bar.clone());
                    self.enqueue_persist(bar.clone());
                    self.broadcast_closed(&ik, tf, bar);
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::match_all;

    fn ik() -> InstrumentKey {
        InstrumentKey::Equity { symbol: "NIFTY-2026-01-29-CE-21500".into() }
    }

    fn tick(ts_ms: i64, price: i64, qty: u64) -> Tick {
        Tick {
            instrument_key: ik(),
            timestamp_ms: ts_ms,
            last_traded_price: price,
            last_traded_quantity: qty,
            cumulative_volume: 0,
            open_interest: 0,
        }
    }

    fn make_aggregator() -> (Aggregator, mpsc::UnboundedReceiver<Bar>) {
        let store = Arc::new(BarStore::new(240));
        let hub = Arc::new(Hub::new(500, 0.9));
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let agg = Aggregator::new(
            AggregatorConfig { timeframes: vec![Timeframe::M1], persistence_high_water: 10_000 },
            store,
            hub,
            tx,
            depth,
        );
        (agg, rx)
    }

    #[tokio::test]
    async fn s1_aggregation_of_a_minute_of_ticks() {
        let (agg, mut persisted) = make_aggregator();
        let t0 = 1_700_000_000_000i64 / 60_000 * 60_000;

        agg.ingest(tick(t0, 150_0000, 100)).await.unwrap();
        agg.ingest(tick(t0 + 10_000, 151_5000, 100)).await.unwrap();
        agg.ingest(tick(t0 + 25_000, 149_7500, 100)).await.unwrap();
        agg.ingest(tick(t0 + 59_000, 150_2500, 100)).await.unwrap();

        let open = agg.store.open_bar(&ik(), Timeframe::M1).unwrap();
        assert_eq!(open.open, 150_0000);
        assert_eq!(open.high, 151_5000);
        assert_eq!(open.low, 149_7500);
        assert_eq!(open.close, 150_2500);
        assert_eq!(open.volume, 400);

        agg.ingest(tick(t0 + 61_000, 152_0000, 100)).await.unwrap();

        let closed = persisted.recv().await.unwrap();
        assert_eq!(closed.bucket_start, t0);
        assert_eq!(closed.close, 150_2500);
        assert_eq!(closed.volume, 400);
        assert!(closed.closed_at.is_some());

        let new_open = agg.store.open_bar(&ik(), Timeframe::M1).unwrap();
        assert_eq!(new_open.bucket_start, t0 + 60_000);
        assert_eq!(new_open.open, 152_0000);
        assert_eq!(new_open.close, 152_0000);
        assert_eq!(new_open.volume, 100);
    }

    #[tokio::test]
    async fn rejects_non_positive_price() {
        let (agg, _rx) = make_aggregator();
        let err = agg.ingest(tick(0, 0, 1)).await.unwrap_err();
        assert!(matches!(err, IngestError::RejectedInvalid(_)));
    }

    #[tokio::test]
    async fn rejects_stale_tick_beyond_grace() {
        let (agg, _rx) = make_aggregator();
        let t0 = 600_000i64;
        agg.ingest(tick(t0, 100_0000, 1)).await.unwrap();
        let err = agg.ingest(tick(t0 - 3_000, 100_0000, 1)).await.unwrap_err();
        assert_eq!(err, IngestError::RejectedStale);
    }

    #[tokio::test]
    async fn accepts_out_of_order_tick_within_grace() {
        let (agg, _rx) = make_aggregator();
        let t0 = 600_000i64;
        agg.ingest(tick(t0, 100_0000, 1)).await.unwrap();
        agg.ingest(tick(t0 - 1_000, 101_0000, 1)).await.unwrap();
        let open = agg.store.open_bar(&ik(), Timeframe::M1).unwrap();
        assert_eq!(open.high, 101_0000);
    }

    #[tokio::test]
    async fn replay_idempotence_produces_identical_bars() {
        let t0 = 900_000i64;
        let ticks = vec![tick(t0, 100_0000, 10), tick(t0 + 10_000, 105_0000, 5), tick(t0 + 61_000, 110_0000, 1)];

        let (agg1, mut rx1) = make_aggregator();
        for t in ticks.clone() {
            agg1.ingest(t).await.unwrap();
        }
        let closed1 = rx1.recv().await.unwrap();

        let (agg2, mut rx2) = make_aggregator();
        for t in ticks {
            agg2.ingest(t).await.unwrap();
        }
        let closed2 = rx2.recv().await.unwrap();

        assert_eq!(closed1.open, closed2.open);
        assert_eq!(closed1.high, closed2.high);
        assert_eq!(closed1.low, closed2.low);
        assert_eq!(closed1.close, closed2.close);
        assert_eq!(closed1.volume, closed2.volume);
    }

    #[tokio::test]
    async fn flush_closes_bars_past_bucket_end_without_new_ticks() {
        let (agg, mut persisted) = make_aggregator();
        let t0 = 1_200_000i64;
        agg.ingest(tick(t0, 100_0000, 1)).await.unwrap();
        agg.flush(t0 + 61_000);
        let closed = persisted.recv().await.unwrap();
        assert_eq!(closed.bucket_start, t0);
        assert!(closed.closed_at.is_some());
    }

    #[tokio::test]
    async fn bar_update_never_emitted_for_higher_timeframes() {
        let store = Arc::new(BarStore::new(240));
        let hub = Arc::new(Hub::new(500, 0.9));
        let mut sub = hub.subscribe(match_all());
        let (tx, _rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let agg = Aggregator::new(
            AggregatorConfig { timeframes: vec![Timeframe::M1, Timeframe::M5], persistence_high_water: 10_000 },
            store,
            hub,
            tx,
            depth,
        );
        agg.ingest(tick(0, 100_0000, 1)).await.unwrap();
        let evt = sub.events.try_recv().unwrap();
        assert_eq!(evt.timeframe(), Some(Timeframe::M1));
        assert!(sub.events.try_recv().is_err());
    }
}
