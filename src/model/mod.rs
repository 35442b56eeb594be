//! Core data model (spec §3): instrument identity, ticks, bars, position
//! snapshots/events, order references, and the WS event envelope.

pub mod bar;
pub mod event;
pub mod instrument;
pub mod order;
pub mod position;
pub mod tick;

pub use bar::{Bar, Timeframe};
pub use event::{DisconnectFrame, DisconnectReason, EventKind, OrderEventPayload, WsEvent};
pub use instrument::{InstrumentKey, OptionType};
pub use order::{CleanupAction, CleanupLogRow, CleanupOutcome, OrderPurpose, OrderReference};
pub use position::{classify_transition, PositionEvent, PositionEventKind, PositionSnapshot};
pub use tick::{Tick, PRICE_SCALE};
