//! Typed error taxonomy (spec §7). Component public contracts return
//! `Result<T, CoreError>`; bootstrap/glue code continues to use
//! `anyhow::Result` with `.context()`, matching the teacher's own split.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    #[error("upstream unavailable (circuit breaker open)")]
    UpstreamUnavailable,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("query exceeded its deadline")]
    QueryTimeout,

    #[error("lock unavailable for key {0}")]
    LockUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// `4xx` for INVALID_INPUT, `5xx` for everything else, per spec §7's
    /// propagation rule for client-observable codes.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, CoreError::InvalidInput(_))
    }
}

/// Tick-ingest specific rejection reasons (spec §4.C).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("tick rejected: older than open bar's bucket_start - 2s")]
    RejectedStale,
    #[error("tick rejected: {0}")]
    RejectedInvalid(String),
}
