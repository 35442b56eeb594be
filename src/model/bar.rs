//! Bar and Timeframe (spec §3).

use super::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
}

impl Timeframe {
    /// Bucket length `L(tf)` in seconds.
    pub fn bucket_seconds(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
        }
    }

    pub fn bucket_millis(self) -> i64 {
        self.bucket_seconds() * 1_000
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }

    pub fn default_set() -> Vec<Timeframe> {
        vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1]
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// OHLCV aggregate over a timeframe bucket. Once `closed_at` is set the
/// bar is immutable — callers must treat a closed `Bar` as a value type,
/// never mutate and re-store it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument_key: InstrumentKey,
    pub timeframe: Timeframe,
    /// Millisecond UTC epoch, floor-aligned to `timeframe.bucket_millis()`.
    pub bucket_start: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: u64,
    pub open_interest_last: u64,
    pub tick_count: u32,
    pub closed_at: Option<i64>,
}

impl Bar {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Testable property #1 (spec §8): OHLC ordering, non-negative volume,
    /// and closed bars only ever close at or after their bucket's end.
    pub fn satisfies_invariants(&self) -> bool {
        let ohlc_ok = self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.low <= self.high;
        let close_time_ok = match self.closed_at {
            Some(closed_at) => self.bucket_start + self.timeframe.bucket_millis() <= closed_at,
            None => true,
        };
        ohlc_ok && close_time_ok
    }
}
