//! SQLite-backed persistence adapter. Schema/pragma/prepared-statement
//! style grounded on the teacher's `signals/db_storage.rs`
//! (`PRAGMA journal_mode = WAL`, `execute_batch`, `prepare_cached`), but
//! pooled with `r2d2`/`r2d2_sqlite` instead of a single
//! `Arc<Mutex<Connection>>` — the teacher never needed a bounded pool
//! with an acquire timeout, this design requires one (spec §4.J).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use super::{BarRepository, OrderRepository, PositionRepository};
use crate::errors::CoreError;
use crate::model::{
    Bar, CleanupAction, CleanupLogRow, CleanupOutcome, InstrumentKey, OrderPurpose, OrderReference,
    PositionSnapshot, Timeframe,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bars (
    instrument_key TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    open INTEGER NOT NULL,
    high INTEGER NOT NULL,
    low INTEGER NOT NULL,
    close INTEGER NOT NULL,
    volume INTEGER NOT NULL,
    open_interest_last INTEGER NOT NULL,
    tick_count INTEGER NOT NULL,
    closed_at INTEGER,
    PRIMARY KEY (instrument_key, timeframe, bucket_start)
);

CREATE INDEX IF NOT EXISTS idx_bars_range ON bars(instrument_key, timeframe, bucket_start);

CREATE TABLE IF NOT EXISTS positions (
    account_id TEXT NOT NULL,
    instrument_key TEXT NOT NULL,
    instrument_key_json TEXT NOT NULL,
    net_quantity INTEGER NOT NULL,
    average_entry_price INTEGER NOT NULL,
    realized_pnl INTEGER NOT NULL,
    source_sequence INTEGER NOT NULL,
    observed_at INTEGER NOT NULL,
    PRIMARY KEY (account_id, instrument_key)
);

CREATE TABLE IF NOT EXISTS order_references (
    account_id TEXT NOT NULL,
    broker_order_id TEXT NOT NULL,
    instrument_key TEXT NOT NULL,
    instrument_key_json TEXT NOT NULL,
    purpose TEXT NOT NULL,
    linked_position_key TEXT NOT NULL,
    position_state TEXT NOT NULL DEFAULT 'ACTIVE',
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (account_id, broker_order_id)
);

CREATE INDEX IF NOT EXISTS idx_orders_position ON order_references(linked_position_key);

CREATE TABLE IF NOT EXISTS cleanup_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    broker_order_id TEXT NOT NULL,
    instrument_key TEXT NOT NULL,
    action TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS distributed_locks (
    key TEXT PRIMARY KEY,
    owner_token TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letter_bars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_key TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
"#;

pub struct SqlitePersistence {
    pool: Pool<SqliteConnectionManager>,
    query_timeout: Duration,
}

impl SqlitePersistence {
    pub fn open(
        db_path: &str,
        min_idle: u32,
        max_size: u32,
        acquire_timeout: Duration,
        query_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .min_idle(Some(min_idle))
            .max_size(max_size)
            .connection_timeout(acquire_timeout)
            .build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Ok(Arc::new(Self { pool, query_timeout }))
    }

    fn pool_exhausted(_e: r2d2::Error) -> CoreError {
        CoreError::PoolExhausted
    }

    /// Shares this pool with [`crate::lock::SqliteLock`] rather than
    /// opening a second connection to the same file.
    pub fn pool_handle(&self) -> Pool<SqliteConnectionManager> {
        self.pool.clone()
    }
}

fn sql_err(e: rusqlite::Error) -> CoreError {
    CoreError::TransientUpstream(e.to_string())
}

#[async_trait]
impl BarRepository for SqlitePersistence {
    async fn upsert_bars(&self, batch: Vec<Bar>) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let query_timeout = self.query_timeout;
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let mut conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let tx = conn.transaction().map_err(sql_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO bars
                           (instrument_key, timeframe, bucket_start, open, high, low, close,
                            volume, open_interest_last, tick_count, closed_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                         ON CONFLICT(instrument_key, timeframe, bucket_start) DO UPDATE SET
                           open=excluded.open, high=excluded.high, low=excluded.low,
                           close=excluded.close, volume=excluded.volume,
                           open_interest_last=excluded.open_interest_last,
                           tick_count=excluded.tick_count, closed_at=excluded.closed_at",
                    )
                    .map_err(sql_err)?;
                for bar in &batch {
                    stmt.execute(params![
                        bar.instrument_key.storage_key(),
                        bar.timeframe.as_str(),
                        bar.bucket_start,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume as i64,
                        bar.open_interest_last as i64,
                        bar.tick_count as i64,
                        bar.closed_at,
                    ])
                    .map_err(sql_err)?;
                }
            }
            tx.commit().map_err(sql_err)?;
            Ok(())
        });
        match tokio::time::timeout(query_timeout, work).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(join_err)) => Err(CoreError::TransientUpstream(join_err.to_string())),
            Err(_) => Err(CoreError::QueryTimeout),
        }
    }

    async fn query_bars(
        &self,
        instrument_key: &InstrumentKey,
        timeframe: Timeframe,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, CoreError> {
        let pool = self.pool.clone();
        let query_timeout = self.query_timeout;
        let ik_str = instrument_key.storage_key();
        let tf_str = timeframe.as_str().to_string();
        let ik_for_rows = instrument_key.clone();
        let work = tokio::task::spawn_blocking(move || -> Result<Vec<Bar>, CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let mut stmt = conn
                .prepare_cached(
                    "SELECT open, high, low, close, volume, open_interest_last, tick_count, bucket_start, closed_at
                       FROM bars
                      WHERE instrument_key = ?1 AND timeframe = ?2 AND bucket_start BETWEEN ?3 AND ?4
                      ORDER BY bucket_start ASC LIMIT ?5",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![ik_str, tf_str, from, to, limit as i64], |row| {
                    Ok(Bar {
                        instrument_key: ik_for_rows.clone(),
                        timeframe,
                        bucket_start: row.get(7)?,
                        open: row.get(0)?,
                        high: row.get(1)?,
                        low: row.get(2)?,
                        close: row.get(3)?,
                        volume: row.get::<_, i64>(4)? as u64,
                        open_interest_last: row.get::<_, i64>(5)? as u64,
                        tick_count: row.get::<_, i64>(6)? as u32,
                        closed_at: row.get(8)?,
                    })
                })
                .map_err(sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
        });
        match tokio::time::timeout(query_timeout, work).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(join_err)) => Err(CoreError::TransientUpstream(join_err.to_string())),
            Err(_) => Err(CoreError::QueryTimeout),
        }
    }

    async fn record_dead_letter(&self, bar: &Bar) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let payload = serde_json::to_string(bar).unwrap_or_default();
        let ik = bar.instrument_key.storage_key();
        let tf = bar.timeframe.as_str().to_string();
        let bucket_start = bar.bucket_start;
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            conn.execute(
                "INSERT INTO dead_letter_bars (instrument_key, timeframe, bucket_start, payload_json, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ik, tf, bucket_start, payload, now_ms()],
            )
            .map_err(sql_err)?;
            Ok(())
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }
}

#[async_trait]
impl PositionRepository for SqlitePersistence {
    async fn upsert_position(&self, snapshot: &PositionSnapshot) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let snapshot = snapshot.clone();
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let ik_json = serde_json::to_string(&snapshot.instrument_key)
                .map_err(|e| CoreError::InvalidInput(format!("instrument key not serializable: {e}")))?;
            conn.execute(
                "INSERT INTO positions
                   (account_id, instrument_key, instrument_key_json, net_quantity, average_entry_price, realized_pnl, source_sequence, observed_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(account_id, instrument_key) DO UPDATE SET
                   instrument_key_json=excluded.instrument_key_json,
                   net_quantity=excluded.net_quantity, average_entry_price=excluded.average_entry_price,
                   realized_pnl=excluded.realized_pnl, source_sequence=excluded.source_sequence,
                   observed_at=excluded.observed_at
                 WHERE excluded.source_sequence > positions.source_sequence",
                params![
                    snapshot.account_id,
                    snapshot.instrument_key.storage_key(),
                    ik_json,
                    snapshot.net_quantity,
                    snapshot.average_entry_price,
                    snapshot.realized_pnl,
                    snapshot.source_sequence as i64,
                    now_ms(),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }

    async fn load_last_positions(&self, account_id: &str) -> Result<Vec<PositionSnapshot>, CoreError> {
        let pool = self.pool.clone();
        let account_id = account_id.to_string();
        let work = tokio::task::spawn_blocking(move || -> Result<Vec<PositionSnapshot>, CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let mut stmt = conn
                .prepare_cached(
                    "SELECT instrument_key_json, net_quantity, average_entry_price, realized_pnl, source_sequence
                       FROM positions WHERE account_id = ?1",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![account_id], |row| {
                    let ik_json: String = row.get(0)?;
                    Ok((ik_json, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?, row.get::<_, i64>(4)? as u64))
                })
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for r in rows {
                let (ik_json, net_quantity, average_entry_price, realized_pnl, source_sequence) = r.map_err(sql_err)?;
                let instrument_key: InstrumentKey = serde_json::from_str(&ik_json)
                    .map_err(|e| CoreError::TransientUpstream(format!("corrupt instrument_key_json: {e}")))?;
                out.push(PositionSnapshot {
                    account_id: account_id.clone(),
                    instrument_key,
                    net_quantity,
                    average_entry_price,
                    realized_pnl,
                    source_sequence,
                });
            }
            Ok(out)
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }
}

#[async_trait]
impl OrderRepository for SqlitePersistence {
    async fn mark_position_state(
        &self,
        account_id: &str,
        instrument_key: &InstrumentKey,
        state: &str,
    ) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let account_id = account_id.to_string();
        let position_key = OrderReference::position_key(&account_id, instrument_key);
        let state = state.to_string();
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            conn.execute(
                "UPDATE order_references SET position_state = ?1, updated_at = ?2 WHERE linked_position_key = ?3",
                params![state, now_ms(), position_key],
            )
            .map_err(sql_err)?;
            Ok(())
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }

    async fn find_protective_orders(
        &self,
        account_id: &str,
        instrument_key: &InstrumentKey,
    ) -> Result<Vec<OrderReference>, CoreError> {
        let pool = self.pool.clone();
        let account_id = account_id.to_string();
        let position_key = OrderReference::position_key(&account_id, instrument_key);
        let ik = instrument_key.clone();
        let work = tokio::task::spawn_blocking(move || -> Result<Vec<OrderReference>, CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let mut stmt = conn
                .prepare_cached(
                    "SELECT broker_order_id, purpose FROM order_references
                      WHERE linked_position_key = ?1 AND purpose IN ('STOP_LOSS','TARGET')",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![position_key], |row| {
                    let purpose_str: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, purpose_str))
                })
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for r in rows {
                let (broker_order_id, purpose_str) = r.map_err(sql_err)?;
                let purpose = match purpose_str.as_str() {
                    "STOP_LOSS" => OrderPurpose::StopLoss,
                    "TARGET" => OrderPurpose::Target,
                    _ => OrderPurpose::Entry,
                };
                out.push(OrderReference {
                    account_id: account_id.clone(),
                    broker_order_id,
                    instrument_key: ik.clone(),
                    purpose,
                    linked_position_key: OrderReference::position_key(&account_id, &ik),
                });
            }
            Ok(out)
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }

    async fn find_pending_cleanup(&self) -> Result<Vec<OrderReference>, CoreError> {
        let pool = self.pool.clone();
        let work = tokio::task::spawn_blocking(move || -> Result<Vec<OrderReference>, CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let mut stmt = conn
                .prepare_cached(
                    "SELECT o.account_id, o.broker_order_id, o.instrument_key_json, o.purpose, o.linked_position_key
                       FROM order_references o
                      WHERE o.position_state IN ('CLOSED', 'REDUCED')
                        AND NOT EXISTS (
                          SELECT 1 FROM cleanup_log c
                           WHERE c.broker_order_id = o.broker_order_id AND c.outcome = 'SUCCEEDED'
                        )",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![], |row| {
                    let ik_json: String = row.get(2)?;
                    let purpose_str: String = row.get(3)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, ik_json, purpose_str, row.get::<_, String>(4)?))
                })
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for r in rows {
                let (account_id, broker_order_id, ik_json, purpose_str, linked_position_key) = r.map_err(sql_err)?;
                let instrument_key: InstrumentKey = serde_json::from_str(&ik_json)
                    .map_err(|e| CoreError::TransientUpstream(format!("corrupt instrument_key_json: {e}")))?;
                out.push(OrderReference {
                    account_id,
                    broker_order_id,
                    instrument_key,
                    purpose: match purpose_str.as_str() {
                        "STOP_LOSS" => OrderPurpose::StopLoss,
                        "TARGET" => OrderPurpose::Target,
                        _ => OrderPurpose::Entry,
                    },
                    linked_position_key,
                });
            }
            Ok(out)
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
    }

    async fn record_cleanup(&self, row: CleanupLogRow) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = pool.get().map_err(SqlitePersistence::pool_exhausted)?;
            let action = match row.action {
                CleanupAction::Cancel => "CANCEL",
                CleanupAction::Modify => "MODIFY",
            };
            let outcome = match row.outcome {
                CleanupOutcome::Succeeded => "SUCCEEDED",
                CleanupOutcome::Failed => "FAILED",
            };
            conn.execute(
                "INSERT INTO cleanup_log (account_id, broker_order_id, instrument_key, action, outcome, detail, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    row.account_id,
                    row.broker_order_id,
                    row.instrument_key.storage_key(),
                    action,
                    outcome,
                    row.detail,
                    row.created_at,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        });
        work.await.map_err(|e| CoreError::TransientUpstream(e.to_string()))?
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
    use crate::model::{OptionType, Timeframe};
    use tempfile::tempdir;

    fn open_test_db() -> (tempfile::TempDir, Arc<SqlitePersistence>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let persistence = SqlitePersistence::open(
            path.to_str().unwrap(),
            1,
            4,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();
        (dir, persistence)
    }

    fn bar(bucket_start: i64) -> Bar {
        Bar {
            instrument_key: InstrumentKey::Equity { symbol: "TEST".into() },
            timeframe: Timeframe::M1,
            bucket_start,
            open: 100_0000,
            high: 110_0000,
            low: 90_0000,
            close: 105_0000,
            volume: 100,
            open_interest_last: 0,
            tick_count: 5,
            closed_at: Some(bucket_start + 60_000),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_replay() {
        let (_dir, db) = open_test_db();
        db.upsert_bars(vec![bar(0)]).await.unwrap();
        db.upsert_bars(vec![bar(0)]).await.unwrap();
        let rows = db
            .query_bars(&InstrumentKey::Equity { symbol: "TEST".into() }, Timeframe::M1, 0, 1_000_000, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 105_0000);
    }

    #[tokio::test]
    async fn query_bars_respects_range_and_limit() {
        let (_dir, db) = open_test_db();
        db.upsert_bars(vec![bar(0), bar(60_000), bar(120_000)]).await.unwrap();
        let rows = db
            .query_bars(&InstrumentKey::Equity { symbol: "TEST".into() }, Timeframe::M1, 0, 60_000, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn positions_upsert_rejects_stale_sequence() {
        let (_dir, db) = open_test_db();
        let ik = InstrumentKey::Equity { symbol: "TEST".into() };
        let snap = |seq: u64, qty: i64| PositionSnapshot {
            account_id: "A1".into(),
            instrument_key: ik.clone(),
            net_quantity: qty,
            average_entry_price: 0,
            realized_pnl: 0,
            source_sequence: seq,
        };
        db.upsert_position(&snap(5, 10)).await.unwrap();
        db.upsert_position(&snap(2, 999)).await.unwrap();
        let positions = db.load_last_positions("A1").await.unwrap();
        assert_eq!(positions[0].net_quantity, 10);
    }

    #[tokio::test]
    async fn derivative_instrument_key_roundtrips_through_positions() {
        let (_dir, db) = open_test_db();
        let ik = InstrumentKey::Derivative {
            underlying: "NIFTY".into(),
            expiry: chrono::NaiveDate::from_ymd_opt(2026, 1, 29).unwrap(),
            option_type: OptionType::Ce,
            strike: Some(215_000_000),
        };
        let snap = PositionSnapshot {
            account_id: "A1".into(),
            instrument_key: ik.clone(),
            net_quantity: 10,
            average_entry_price: 0,
            realized_pnl: 0,
            source_sequence: 1,
        };
        db.upsert_position(&snap).await.unwrap();
        let positions = db.load_last_positions("A1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].instrument_key, ik);
    }

    #[tokio::test]
    async fn dead_letter_records_unparseable_loss() {
        let (_dir, db) = open_test_db();
        db.record_dead_letter(&bar(0)).await.unwrap();
    }

    #[test]
    fn option_type_roundtrips_through_storage_key() {
        let ik = InstrumentKey::Derivative {
            underlying: "NIFTY".into(),
            expiry: chrono::NaiveDate::from_ymd_opt(2026, 1, 29).unwrap(),
            option_type: OptionType::Ce,
            strike: Some(215_000_000),
        };
        assert!(ik.storage_key().contains("CE"));
    }
}
