//! Persistence adapter (spec §4.J). Typed upsert/query surface to the
//! time-series store, pooled with a bounded acquire timeout.

pub mod sqlite;

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::model::{Bar, CleanupLogRow, InstrumentKey, OrderReference, PositionSnapshot, Timeframe};

#[async_trait]
pub trait BarRepository: Send + Sync {
    /// Idempotent upsert keyed on `(instrument_key, timeframe, bucket_start)`.
    async fn upsert_bars(&self, batch: Vec<Bar>) -> Result<(), CoreError>;
    async fn query_bars(
        &self,
        instrument_key: &InstrumentKey,
        timeframe: Timeframe,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, CoreError>;
    /// Records a bar that exhausted its persistence retry budget (spec
    /// §4.C: "moved to a dead-letter sink").
    async fn record_dead_letter(&self, bar: &Bar) -> Result<(), CoreError>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn upsert_position(&self, snapshot: &PositionSnapshot) -> Result<(), CoreError>;
    async fn load_last_positions(&self, account_id: &str) -> Result<Vec<PositionSnapshot>, CoreError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Marks every order linked to `(account_id, instrument_key)` with
    /// the position state observed by the tracker, so a later
    /// `find_pending_cleanup` sweep can discover work the original
    /// event-driven path never finished (spec §8 S5).
    async fn mark_position_state(
        &self,
        account_id: &str,
        instrument_key: &InstrumentKey,
        state: &str,
    ) -> Result<(), CoreError>;

    /// Single batched lookup (no N+1 per order), per spec §4.F step 2.
    async fn find_protective_orders(
        &self,
        account_id: &str,
        instrument_key: &InstrumentKey,
    ) -> Result<Vec<OrderReference>, CoreError>;

    /// Protective orders whose linked position is CLOSED/REDUCED but
    /// lack a `cleanup_log` row — feeds the periodic lock-sweep retry
    /// path (spec §8 S5).
    async fn find_pending_cleanup(&self) -> Result<Vec<OrderReference>, CoreError>;

    async fn record_cleanup(&self, row: CleanupLogRow) -> Result<(), CoreError>;
}
