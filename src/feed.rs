//! Upstream tick/position feed adapters (spec §4.A, §4.D, §6). Reconnect
//! loop with exponential backoff, atomic counters, and a heartbeat task
//! grounded on the teacher's `edge::receiver::EdgeReceiver`, generalized
//! from manual Binance JSON scanning to `serde_json` deserialization of
//! an upstream wire format and from UDP forwarding to an in-process
//! `mpsc` channel feeding the aggregator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::model::{InstrumentKey, PositionSnapshot, Tick};

#[derive(Debug, Deserialize)]
struct WireTick {
    instrument_key: InstrumentKey,
    timestamp_ms: i64,
    last_traded_price: i64,
    #[serde(default)]
    last_traded_quantity: u64,
    #[serde(default)]
    cumulative_volume: u64,
    #[serde(default)]
    open_interest: u64,
}

impl From<WireTick> for Tick {
    fn from(w: WireTick) -> Self {
        Tick {
            instrument_key: w.instrument_key,
            timestamp_ms: w.timestamp_ms,
            last_traded_price: w.last_traded_price,
            last_traded_quantity: w.last_traded_quantity,
            cumulative_volume: w.cumulative_volume,
            open_interest: w.open_interest,
        }
    }
}

#[derive(Debug, Default)]
pub struct FeedStats {
    pub messages_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FeedStatsSnapshot {
    pub messages_received: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickFeedConfig {
    pub ws_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TickFeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://upstream.example/ticks".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Reconnecting WebSocket tick feed (spec §4.A). Parsed ticks are
/// forwarded to `out`; the aggregator consumes from the other end.
pub struct TickFeed {
    config: TickFeedConfig,
    stats: Arc<FeedStats>,
}

impl TickFeed {
    pub fn new(config: TickFeedConfig) -> Arc<Self> {
        Arc::new(Self { config, stats: Arc::new(FeedStats::default()) })
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Runs until `shutdown` fires. Never returns `Err` on a transient
    /// network failure — it reconnects with exponential backoff instead;
    /// only a send failure on `out` (receiver dropped) ends the loop.
    pub async fn run(self: Arc<Self>, out: mpsc::Sender<Tick>, shutdown: tokio_util::sync::CancellationToken) {
        let mut backoff = self.config.initial_backoff;

        while !shutdown.is_cancelled() {
            info!(url = %self.config.ws_url, "connecting to tick feed");
            match connect_async(&self.config.ws_url).await {
                Ok((ws_stream, _)) => {
                    backoff = self.config.initial_backoff;
                    let (mut write, mut read) = ws_stream.split();
                    let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = heartbeat.tick() => {
                                if write.send(Message::Ping(Vec::new())).await.is_err() {
                                    break;
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                                        match serde_json::from_str::<WireTick>(&text) {
                                            Ok(wire) => {
                                                if out.send(wire.into()).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                                                debug!(error = %e, "failed to parse upstream tick");
                                            }
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = write.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        warn!(error = %e, "tick feed websocket error");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "tick feed connection failed"),
            }

            if shutdown.is_cancelled() {
                return;
            }
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePositionSnapshot {
    account_id: String,
    instrument_key: InstrumentKey,
    net_quantity: i64,
    average_entry_price: i64,
    realized_pnl: i64,
    source_sequence: u64,
}

impl From<WirePositionSnapshot> for PositionSnapshot {
    fn from(w: WirePositionSnapshot) -> Self {
        PositionSnapshot {
            account_id: w.account_id,
            instrument_key: w.instrument_key,
            net_quantity: w.net_quantity,
            average_entry_price: w.average_entry_price,
            realized_pnl: w.realized_pnl,
            source_sequence: w.source_sequence,
        }
    }
}

/// Reconnecting broker position feed (spec §4.E). Same reconnect/backoff
/// shape as [`TickFeed`]; kept as a separate type since the wire payload
/// and destination channel differ.
pub struct PositionFeed {
    config: TickFeedConfig,
    stats: Arc<FeedStats>,
}

impl PositionFeed {
    pub fn new(config: TickFeedConfig) -> Arc<Self> {
        Arc::new(Self { config, stats: Arc::new(FeedStats::default()) })
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    pub async fn run(
        self: Arc<Self>,
        out: mpsc::Sender<PositionSnapshot>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut backoff = self.config.initial_backoff;

        while !shutdown.is_cancelled() {
            match connect_async(&self.config.ws_url).await {
                Ok((ws_stream, _)) => {
                    backoff = self.config.initial_backoff;
                    let (_write, mut read) = ws_stream.split();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                                        match serde_json::from_str::<WirePositionSnapshot>(&text) {
                                            Ok(wire) => {
                                                if out.send(wire.into()).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                                                debug!(error = %e, "failed to parse upstream position snapshot");
                                            }
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        warn!(error = %e, "position feed websocket error");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "position feed connection failed"),
            }

            if shutdown.is_cancelled() {
                return;
            }
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tick_parses_minimal_payload() {
        let json = r#"{"instrument_key":{"kind":"Equity","symbol":"TEST"},"timestamp_ms":1000,"last_traded_price":1500000}"#;
        let wire: WireTick = serde_json::from_str(json).unwrap();
        let tick: Tick = wire.into();
        assert_eq!(tick.last_traded_price, 1_500_000);
        assert_eq!(tick.last_traded_quantity, 0);
    }

    #[test]
    fn wire_position_snapshot_parses() {
        let json = r#"{"account_id":"A1","instrument_key":{"kind":"Equity","symbol":"TEST"},"net_quantity":10,"average_entry_price":1000,"realized_pnl":0,"source_sequence":1}"#;
        let wire: WirePositionSnapshot = serde_json::from_str(json).unwrap();
        let snap: PositionSnapshot = wire.into();
        assert_eq!(snap.net_quantity, 10);
    }
}
