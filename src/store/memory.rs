// =============================================================================
// In-memory candle store
// =============================================================================
//
// Same semantics as the SQLite store, held in a BTreeMap so range scans come
// out ordered. Used by tests and by deployments without a database path.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{CandleStore, StoreStats};
use crate::calendar::Interval;
use crate::types::Candle;

type RowKey = (String, Interval, i64);

#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    rows: RwLock<BTreeMap<RowKey, Candle>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Direct row lookup, bypassing the async trait.
    pub fn get(&self, symbol: &str, interval: Interval, bucket_start: i64) -> Option<Candle> {
        self.rows
            .read()
            .get(&(symbol.to_string(), interval, bucket_start))
            .cloned()
    }

    fn series(&self, symbol: &str, interval: Interval, from: i64, to: i64) -> Vec<Candle> {
        if from > to {
            return Vec::new();
        }
        let lo = (symbol.to_string(), interval, from);
        let hi = (symbol.to_string(), interval, to);
        self.rows.read().range(lo..=hi).map(|(_, c)| c.clone()).collect()
    }
}

fn keep_tail(mut rows: Vec<Candle>, limit: Option<usize>) -> Vec<Candle> {
    if let Some(n) = limit {
        let start = rows.len().saturating_sub(n);
        rows.drain(..start);
    }
    rows
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn upsert(&self, candle: &Candle) -> Result<()> {
        let key = (candle.symbol.clone(), candle.interval, candle.bucket_start);
        let mut rows = self.rows.write();
        match rows.get(&key) {
            Some(existing) if existing.is_complete => {
                debug!(key = %candle.key(), bucket = candle.bucket_start, "upsert ignored: row already complete");
            }
            _ => {
                rows.insert(key, candle.clone());
            }
        }
        Ok(())
    }

    async fn range_query(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        Ok(keep_tail(self.series(symbol, interval, from, to), limit))
    }

    async fn latest(&self, symbol: &str, interval: Interval, n: usize) -> Result<Vec<Candle>> {
        Ok(keep_tail(self.series(symbol, interval, i64::MIN, i64::MAX), Some(n)))
    }

    async fn mark_complete(&self, symbol: &str, interval: Interval, bucket_start: i64) -> Result<bool> {
        let mut rows = self.rows.write();
        match rows.get_mut(&(symbol.to_string(), interval, bucket_start)) {
            Some(row) if !row.is_complete => {
                row.is_complete = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|(_, _, start), _| *start >= cutoff);
        Ok(before - rows.len())
    }

    async fn incomplete_before(&self, cutoff: i64) -> Result<Vec<Candle>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|c| !c.is_complete && c.bucket_end() <= cutoff)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows = self.rows.read();
        let symbols: BTreeSet<String> = rows.keys().map(|(s, _, _)| s.clone()).collect();
        let intervals: BTreeSet<Interval> = rows.keys().map(|(_, iv, _)| *iv).collect();
        let latest_candle = rows.values().max_by_key(|c| c.bucket_start).cloned();

        Ok(StoreStats {
            total_candles: rows.len() as u64,
            symbols: symbols.into_iter().collect(),
            intervals: intervals.into_iter().collect(),
            latest_candle,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
