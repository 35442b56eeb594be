//! Instrument identity (spec data model §3).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Ce,
    Pe,
    Fut,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Ce => write!(f, "CE"),
            OptionType::Pe => write!(f, "PE"),
            OptionType::Fut => write!(f, "FUT"),
        }
    }
}

/// Uniquely identifies a tradable contract. Compared by value, never by
/// pointer or handle — this type derives `PartialEq`/`Hash` and is used
/// directly as a map key throughout the bar store and hub predicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InstrumentKey {
    Equity {
        symbol: String,
    },
    Derivative {
        underlying: String,
        expiry: NaiveDate,
        option_type: OptionType,
        /// Strike in the smallest price unit; omitted (None) for FUT.
        strike: Option<i64>,
    },
}

impl InstrumentKey {
    /// Canonical string form, used as a SQL column value and as a log field.
    pub fn storage_key(&self) -> String {
        match self {
            InstrumentKey::Equity { symbol } => symbol.clone(),
            InstrumentKey::Derivative {
                underlying,
                expiry,
                option_type,
                strike,
            } => match strike {
                Some(k) => format!("{underlying}-{expiry}-{option_type}-{k}"),
                None => format!("{underlying}-{expiry}-{option_type}"),
            },
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}
