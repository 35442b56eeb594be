//! Order reference (spec §3, §4.F).

use super::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPurpose {
    StopLoss,
    Target,
    Entry,
}

impl OrderPurpose {
    /// Protective orders (STOP_LOSS, TARGET) are subject to cleanup when
    /// their linked position closes or reduces; ENTRY orders are not.
    pub fn is_protective(self) -> bool {
        matches!(self, OrderPurpose::StopLoss | OrderPurpose::Target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReference {
    pub account_id: String,
    pub broker_order_id: String,
    pub instrument_key: InstrumentKey,
    pub purpose: OrderPurpose,
    pub linked_position_key: String,
}

impl OrderReference {
    pub fn position_key(account_id: &str, instrument_key: &InstrumentKey) -> String {
        format!("{account_id}:{}", instrument_key.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupAction {
    Cancel,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupLogRow {
    pub account_id: String,
    pub broker_order_id: String,
    pub instrument_key: InstrumentKey,
    pub action: CleanupAction,
    pub outcome: CleanupOutcome,
    pub detail: Option<String>,
    pub created_at: i64,
}
