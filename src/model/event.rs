//! WebSocket fan-out event envelope (spec §6).

use super::bar::Timeframe;
use super::instrument::InstrumentKey;
use super::order::{CleanupAction, CleanupOutcome};
use super::position::PositionEvent;
use super::Bar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEventPayload {
    pub account_id: String,
    pub broker_order_id: String,
    pub instrument_key: InstrumentKey,
    pub action: CleanupAction,
    pub outcome: CleanupOutcome,
}

/// The event types the core emits (spec §6): `BAR_UPDATE`, `BAR_CLOSED`,
/// `POSITION_EVENT`, `ORDER_EVENT`, `HEARTBEAT`. Serializes as
/// `{ "type": ..., instrument_key?, timeframe?, payload }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    #[serde(rename = "BAR_UPDATE")]
    BarUpdate {
        instrument_key: InstrumentKey,
        timeframe: Timeframe,
        payload: Bar,
    },
    #[serde(rename = "BAR_CLOSED")]
    BarClosed {
        instrument_key: InstrumentKey,
        timeframe: Timeframe,
        payload: Bar,
    },
    #[serde(rename = "POSITION_EVENT")]
    PositionEvent { payload: PositionEvent },
    #[serde(rename = "ORDER_EVENT")]
    OrderEvent { payload: OrderEventPayload },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { timestamp: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    BarUpdate,
    BarClosed,
    PositionEvent,
    OrderEvent,
    Heartbeat,
}

impl WsEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WsEvent::BarUpdate { .. } => EventKind::BarUpdate,
            WsEvent::BarClosed { .. } => EventKind::BarClosed,
            WsEvent::PositionEvent { .. } => EventKind::PositionEvent,
            WsEvent::OrderEvent { .. } => EventKind::OrderEvent,
            WsEvent::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }

    pub fn instrument_key(&self) -> Option<&InstrumentKey> {
        match self {
            WsEvent::BarUpdate { instrument_key, .. } | WsEvent::BarClosed { instrument_key, .. } => {
                Some(instrument_key)
            }
            _ => None,
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        match self {
            WsEvent::BarUpdate { timeframe, .. } | WsEvent::BarClosed { timeframe, .. } => Some(*timeframe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    SlowConsumer,
    AuthExpired,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub reason: DisconnectReason,
}

impl DisconnectFrame {
    pub fn new(reason: DisconnectReason) -> Self {
        Self { frame_type: "DISCONNECT", reason }
    }
}
