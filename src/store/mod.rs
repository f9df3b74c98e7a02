// =============================================================================
// Candle Store — durable, idempotent candle persistence
// =============================================================================
//
// Every row is keyed by `(symbol, interval, bucket_start)`. Writes are
// upserts with last-write-wins, except that a row which is already complete
// is never touched again: `is_complete` only ever moves false -> true.
// =============================================================================

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::calendar::Interval;
use crate::types::Candle;

pub use memory::MemoryCandleStore;
pub use sqlite::SqliteCandleStore;

/// Summary of what the store currently holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_candles: u64,
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub latest_candle: Option<Candle>,
}

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or overwrite the row for the candle's key. A no-op when the
    /// stored row is already complete.
    async fn upsert(&self, candle: &Candle) -> Result<()>;

    /// Upsert a batch, returning how many candles were submitted.
    async fn upsert_many(&self, candles: &[Candle]) -> Result<usize> {
        for candle in candles {
            self.upsert(candle).await?;
        }
        Ok(candles.len())
    }

    /// Rows with `from <= bucket_start <= to`, ascending. With a `limit`,
    /// only the most recent `limit` rows of the range are returned.
    async fn range_query(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>>;

    /// The `n` most recent rows for the series, ascending.
    async fn latest(&self, symbol: &str, interval: Interval, n: usize) -> Result<Vec<Candle>>;

    /// Flip a row to complete. Returns `false` when the row is missing or
    /// already complete.
    async fn mark_complete(&self, symbol: &str, interval: Interval, bucket_start: i64) -> Result<bool>;

    /// Delete every row whose bucket started before `cutoff`.
    async fn delete_older_than(&self, cutoff: i64) -> Result<usize>;

    /// Incomplete rows whose bucket ended at or before `cutoff`.
    async fn incomplete_before(&self, cutoff: i64) -> Result<Vec<Candle>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Release the underlying connection(s). Later calls fail.
    async fn close(&self) {}
}

// =============================================================================
// Shared contract checks, run against every implementation
// =============================================================================

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::types::CandleSource;

    pub fn candle(symbol: &str, interval: Interval, start: i64, close: f64) -> Candle {
        let mut c = Candle::opened(symbol, interval, start, close);
        c.apply(close + 1.0);
        c.apply(close);
        c
    }

    pub async fn upsert_is_idempotent(store: &dyn CandleStore) {
        let mut c = candle("EURUSD", Interval::M1, 60, 1.08);
        store.upsert(&c).await.unwrap();
        c.apply(1.0755);
        store.upsert(&c).await.unwrap();

        let rows = store.range_query("EURUSD", Interval::M1, 0, 600, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 1.0755);
        assert_eq!(rows[0].low, 1.0755);
        assert_eq!(rows[0].volume, 4.0);
    }

    pub async fn complete_rows_are_immutable(store: &dyn CandleStore) {
        let c = candle("XAU", Interval::M5, 300, 2_000.0);
        store.upsert(&c.completed()).await.unwrap();

        let mut stale = c.clone();
        stale.close = 1_999.0;
        stale.low = 1_999.0;
        store.upsert(&stale).await.unwrap();

        let rows = store.latest("XAU", Interval::M5, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_complete);
        assert_eq!(rows[0].close, 2_000.0);

        assert!(!store.mark_complete("XAU", Interval::M5, 300).await.unwrap());
        assert!(!store.mark_complete("XAU", Interval::M5, 600).await.unwrap());
    }

    pub async fn mark_complete_transitions_once(store: &dyn CandleStore) {
        store.upsert(&candle("BTC", Interval::H1, 3_600, 40_000.0)).await.unwrap();
        assert!(store.mark_complete("BTC", Interval::H1, 3_600).await.unwrap());
        assert!(!store.mark_complete("BTC", Interval::H1, 3_600).await.unwrap());
        let rows = store.latest("BTC", Interval::H1, 1).await.unwrap();
        assert!(rows[0].is_complete);
    }

    pub async fn range_latest_and_retention(store: &dyn CandleStore) {
        for i in 0..10 {
            let mut c = candle("GBPUSD", Interval::M1, i * 60, 1.25 + i as f64 * 0.001);
            c.source = CandleSource::Provider;
            store.upsert(&c.completed()).await.unwrap();
        }
        store.upsert(&candle("GBPUSD", Interval::M5, 0, 1.25)).await.unwrap();

        let all = store.range_query("GBPUSD", Interval::M1, 120, 300, None).await.unwrap();
        let times: Vec<i64> = all.iter().map(|c| c.bucket_start).collect();
        assert_eq!(times, vec![120, 180, 240, 300]);

        let tail = store.range_query("GBPUSD", Interval::M1, 0, 540, Some(3)).await.unwrap();
        let times: Vec<i64> = tail.iter().map(|c| c.bucket_start).collect();
        assert_eq!(times, vec![420, 480, 540]);
        assert_eq!(tail[0].source, CandleSource::Provider);

        let latest = store.latest("GBPUSD", Interval::M1, 2).await.unwrap();
        let times: Vec<i64> = latest.iter().map(|c| c.bucket_start).collect();
        assert_eq!(times, vec![480, 540]);

        let removed = store.delete_older_than(300).await.unwrap();
        assert_eq!(removed, 6);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_candles, 5);
        assert_eq!(stats.symbols, vec!["GBPUSD".to_string()]);
        assert_eq!(stats.intervals, vec![Interval::M1]);
        assert_eq!(stats.latest_candle.map(|c| c.bucket_start), Some(540));
    }

    pub async fn incomplete_scan(store: &dyn CandleStore) {
        store.upsert(&candle("ETH", Interval::M1, 0, 2_000.0)).await.unwrap();
        store.upsert(&candle("ETH", Interval::M5, 0, 2_000.0)).await.unwrap();
        store.upsert(&candle("ETH", Interval::M1, 60, 2_001.0).completed()).await.unwrap();

        let stale = store.incomplete_before(120).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].interval, Interval::M1);
        assert_eq!(stale[0].bucket_start, 0);

        let stale = store.incomplete_before(300).await.unwrap();
        assert_eq!(stale.len(), 2);
    }
}
