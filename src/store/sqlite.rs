// =============================================================================
// SQLite candle store — r2d2 pool, blocking calls off the async runtime
// =============================================================================
//
// One table, one row per (symbol, interval, time). Upserts use
// `ON CONFLICT ... DO UPDATE ... WHERE is_complete = 0` so that a finalized
// row can never be overwritten or flipped back to incomplete.
//
// Every call runs on `spawn_blocking` and is bounded by `op_timeout`.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use super::{CandleStore, StoreStats};
use crate::calendar::Interval;
use crate::types::{Candle, CandleSource};

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    symbol       TEXT    NOT NULL,
    interval     TEXT    NOT NULL,
    time         INTEGER NOT NULL,
    open         REAL    NOT NULL,
    high         REAL    NOT NULL,
    low          REAL    NOT NULL,
    close        REAL    NOT NULL,
    volume       REAL    NOT NULL DEFAULT 0,
    source       TEXT    NOT NULL DEFAULT 'stream',
    is_complete  INTEGER NOT NULL DEFAULT 0,
    updated_at   INTEGER NOT NULL,
    UNIQUE (symbol, interval, time)
);
CREATE INDEX IF NOT EXISTS idx_candles_series ON candles (symbol, interval, time);
CREATE INDEX IF NOT EXISTS idx_candles_complete ON candles (is_complete);
";

const UPSERT: &str = "
INSERT INTO candles (symbol, interval, time, open, high, low, close, volume, source, is_complete, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT (symbol, interval, time) DO UPDATE SET
    open        = excluded.open,
    high        = excluded.high,
    low         = excluded.low,
    close       = excluded.close,
    volume      = excluded.volume,
    source      = excluded.source,
    is_complete = excluded.is_complete,
    updated_at  = excluded.updated_at
WHERE candles.is_complete = 0
";

const COLUMNS: &str = "symbol, interval, time, open, high, low, close, volume, source, is_complete";

/// Raw row before the text columns are parsed back into enums.
struct CandleRow {
    symbol: String,
    interval: String,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    source: String,
    is_complete: bool,
}

impl CandleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            interval: row.get(1)?,
            time: row.get(2)?,
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            source: row.get(8)?,
            is_complete: row.get(9)?,
        })
    }

    fn into_candle(self) -> Result<Candle> {
        let interval: Interval = self.interval.parse()?;
        let source = CandleSource::parse(&self.source)
            .with_context(|| format!("unknown candle source in store: {}", self.source))?;
        Ok(Candle {
            symbol: self.symbol,
            interval,
            bucket_start: self.time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            source,
            is_complete: self.is_complete,
        })
    }
}

fn query_candles(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Candle>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, CandleRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(CandleRow::into_candle).collect()
}

fn write_candle(conn: &Connection, c: &Candle, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        UPSERT,
        params![
            c.symbol,
            c.interval.label(),
            c.bucket_start,
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume,
            c.source.as_str(),
            c.is_complete,
            now,
        ],
    )
}

pub struct SqliteCandleStore {
    pool: RwLock<Option<DbPool>>,
    op_timeout: Duration,
}

impl SqliteCandleStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>, max_size: u32, op_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.busy_timeout(Duration::from_secs(5))?;
            c.execute_batch("PRAGMA synchronous = NORMAL;")
        });
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(op_timeout)
            .build(manager)
            .with_context(|| format!("failed to create sqlite pool for {}", path.display()))?;

        let store = Self::from_pool(pool, op_timeout)?;
        info!(path = %path.display(), "sqlite candle store opened");
        Ok(store)
    }

    /// Single-connection in-memory database.
    pub fn in_memory(op_timeout: Duration) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(op_timeout)
            .build(SqliteConnectionManager::memory())
            .context("failed to create in-memory sqlite pool")?;
        Self::from_pool(pool, op_timeout)
    }

    fn from_pool(pool: DbPool, op_timeout: Duration) -> Result<Self> {
        pool.get()
            .context("failed to check out sqlite connection")?
            .execute_batch(SCHEMA)
            .context("failed to create candles schema")?;
        Ok(Self {
            pool: RwLock::new(Some(pool)),
            op_timeout,
        })
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self
            .pool
            .read()
            .clone()
            .with_context(|| format!("sqlite {op} called after store was closed"))?;

        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("failed to check out sqlite connection")?;
            f(&mut *conn)
        });

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(joined) => joined.with_context(|| format!("sqlite {op} task failed"))?,
            Err(_) => anyhow::bail!("sqlite {op} timed out after {:?}", self.op_timeout),
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn upsert(&self, candle: &Candle) -> Result<()> {
        let c = candle.clone();
        self.with_conn("upsert", move |conn| {
            let changed = write_candle(conn, &c, now_secs())
                .with_context(|| format!("failed to upsert candle {} @ {}", c.key(), c.bucket_start))?;
            if changed == 0 {
                debug!(key = %c.key(), bucket = c.bucket_start, "upsert ignored: row already complete");
            }
            Ok(())
        })
        .await
    }

    async fn upsert_many(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let batch = candles.to_vec();
        self.with_conn("upsert_many", move |conn| {
            let tx = conn.transaction().context("failed to begin transaction")?;
            let now = now_secs();
            for c in &batch {
                write_candle(&tx, c, now)
                    .with_context(|| format!("failed to upsert candle {} @ {}", c.key(), c.bucket_start))?;
            }
            tx.commit().context("failed to commit candle batch")?;
            debug!(count = batch.len(), "persisted candle batch");
            Ok(batch.len())
        })
        .await
    }

    async fn range_query(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        let symbol = symbol.to_string();
        // Newest-first with LIMIT, then flipped back to ascending.
        let limit = limit.map_or(-1, |n| n as i64);
        self.with_conn("range_query", move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM candles
                 WHERE symbol = ?1 AND interval = ?2 AND time >= ?3 AND time <= ?4
                 ORDER BY time DESC LIMIT ?5"
            );
            let mut rows = query_candles(conn, &sql, params![symbol, interval.label(), from, to, limit])?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn latest(&self, symbol: &str, interval: Interval, n: usize) -> Result<Vec<Candle>> {
        let symbol = symbol.to_string();
        self.with_conn("latest", move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM candles
                 WHERE symbol = ?1 AND interval = ?2
                 ORDER BY time DESC LIMIT ?3"
            );
            let mut rows = query_candles(conn, &sql, params![symbol, interval.label(), n as i64])?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn mark_complete(&self, symbol: &str, interval: Interval, bucket_start: i64) -> Result<bool> {
        let symbol = symbol.to_string();
        self.with_conn("mark_complete", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE candles SET is_complete = 1, updated_at = ?4
                     WHERE symbol = ?1 AND interval = ?2 AND time = ?3 AND is_complete = 0",
                    params![symbol, interval.label(), bucket_start, now_secs()],
                )
                .context("failed to mark candle complete")?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        self.with_conn("delete_older_than", move |conn| {
            conn.execute("DELETE FROM candles WHERE time < ?1", params![cutoff])
                .context("failed to delete old candles")
        })
        .await
    }

    async fn incomplete_before(&self, cutoff: i64) -> Result<Vec<Candle>> {
        let rows = self
            .with_conn("incomplete_before", move |conn| {
                let sql = format!(
                    "SELECT {COLUMNS} FROM candles
                     WHERE is_complete = 0 AND time < ?1
                     ORDER BY time ASC"
                );
                query_candles(conn, &sql, params![cutoff])
            })
            .await?;
        Ok(rows.into_iter().filter(|c| c.bucket_end() <= cutoff).collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_conn("stats", |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM candles", [], |r| r.get(0))?;

            let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM candles ORDER BY symbol")?;
            let symbols = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare("SELECT DISTINCT interval FROM candles")?;
            let labels = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut intervals = Vec::with_capacity(labels.len());
            for label in labels {
                match label.parse::<Interval>() {
                    Ok(iv) => intervals.push(iv),
                    Err(e) => warn!(error = %e, "skipping unknown interval in store stats"),
                }
            }
            intervals.sort();

            let sql = format!("SELECT {COLUMNS} FROM candles ORDER BY time DESC, updated_at DESC LIMIT 1");
            let latest_candle = query_candles(conn, &sql, [])?.into_iter().next();

            Ok(StoreStats {
                total_candles: total.max(0) as u64,
                symbols,
                intervals,
                latest_candle,
            })
        })
        .await
    }

    async fn close(&self) {
        if self.pool.write().take().is_some() {
            info!("sqlite candle store closed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    fn store() -> SqliteCandleStore {
        SqliteCandleStore::in_memory(Duration::from_secs(5)).expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        contract::upsert_is_idempotent(&store()).await;
    }

    #[tokio::test]
    async fn complete_rows_are_immutable() {
        contract::complete_rows_are_immutable(&store()).await;
    }

    #[tokio::test]
    async fn mark_complete_transitions_once() {
        contract::mark_complete_transitions_once(&store()).await;
    }

    #[tokio::test]
    async fn range_latest_and_retention() {
        contract::range_latest_and_retention(&store()).await;
    }

    #[tokio::test]
    async fn incomplete_scan() {
        contract::incomplete_scan(&store()).await;
    }

    #[tokio::test]
    async fn batch_upsert_and_high_magnitude_prices() {
        let s = store();
        let mut big = contract::candle("IDX", Interval::D1, 86_400, 492_948.12345);
        big.source = CandleSource::Provider;
        let small = contract::candle("EURUSD", Interval::D1, 86_400, 1.08001);
        assert_eq!(s.upsert_many(&[big.completed(), small.clone()]).await.unwrap(), 2);

        let rows = s.latest("IDX", Interval::D1, 5).await.unwrap();
        assert_eq!(rows[0].close, 492_948.12345);
        assert_eq!(rows[0].source, CandleSource::Provider);
        let rows = s.latest("EURUSD", Interval::D1, 5).await.unwrap();
        assert_eq!(rows[0].close, 1.08001);
        assert!(!rows[0].is_complete);
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let s = store();
        s.close().await;
        assert!(s.stats().await.is_err());
        // Closing twice is harmless.
        s.close().await;
    }
}
