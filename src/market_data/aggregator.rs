// =============================================================================
// Candle Aggregator — one tick stream, every interval at once
// =============================================================================
//
// Each accepted tick is folded into the in-progress candle of every supported
// interval for its symbol. When a tick lands in a later bucket than the one
// held in memory, the held candle is finalized (persisted complete, evicted)
// and a fresh one is opened. Every tick re-persists the open candles so an
// unclean exit loses at most the latest tick's delta.
//
// State per (symbol, interval):  Empty -> Open -> Open(updated)* -> Final -> Empty
//
// Finalization also happens from the periodic sweep (no tick arrived but the
// wall clock passed the bucket end) and from the shutdown flush.
//
// Persistence failures are logged and counted, never returned: the in-memory
// candle stays authoritative and is written again on the next tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::calendar::{bucket_start, Interval};
use crate::store::CandleStore;
use crate::types::{Candle, CandleKey, Tick};

/// Capacity of the finalized-candle broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Accepted price range for incoming ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub min: f64,
    pub max: f64,
}

impl PriceBounds {
    pub fn contains(&self, price: f64) -> bool {
        price.is_finite() && price > 0.0 && price >= self.min && price <= self.max
    }
}

impl Default for PriceBounds {
    fn default() -> Self {
        Self {
            min: 0.01,
            max: 1_000_000.0,
        }
    }
}

/// Why a candle was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeReason {
    Rollover,
    Sweep,
    Shutdown,
}

/// Published once per finalized candle.
#[derive(Debug, Clone, Serialize)]
pub struct CandleEvent {
    pub candle: Candle,
    pub reason: FinalizeReason,
}

/// What `handle_tick` did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Applied,
    Rejected,
    /// Older than every bucket held or finalized for the symbol.
    Stale,
    ShuttingDown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub ticks_accepted: u64,
    pub ticks_rejected: u64,
    pub ticks_stale: u64,
    pub candles_finalized: u64,
    pub persist_failures: u64,
    pub in_progress: usize,
}

/// In-memory candle state, guarded by one lock.
#[derive(Default)]
struct Book {
    open: HashMap<CandleKey, Candle>,
    /// Newest bucket already finalized per key; older ticks are ignored.
    closed_through: HashMap<CandleKey, i64>,
}

pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
    bounds: PriceBounds,
    book: Mutex<Book>,
    latest_prices: RwLock<HashMap<String, f64>>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<CandleEvent>,

    ticks_accepted: AtomicU64,
    ticks_rejected: AtomicU64,
    ticks_stale: AtomicU64,
    candles_finalized: AtomicU64,
    persist_failures: AtomicU64,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>, bounds: PriceBounds) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            bounds,
            book: Mutex::new(Book::default()),
            latest_prices: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            events,
            ticks_accepted: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            ticks_stale: AtomicU64::new(0),
            candles_finalized: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Fold one tick into every interval and persist the affected candles.
    pub async fn handle_tick(&self, tick: &Tick) -> TickOutcome {
        if self.is_shutting_down() {
            debug!(symbol = %tick.symbol, "tick ignored: shutting down");
            return TickOutcome::ShuttingDown;
        }
        if tick.symbol.is_empty() || !self.bounds.contains(tick.price) {
            self.ticks_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %tick.symbol,
                price = tick.price,
                min = self.bounds.min,
                max = self.bounds.max,
                "tick rejected: invalid price"
            );
            return TickOutcome::Rejected;
        }

        let ts = tick.timestamp_secs();
        let mut finalized = Vec::new();
        let mut current = Vec::with_capacity(Interval::ALL.len());

        {
            let mut book = self.book.lock();
            for interval in Interval::ALL {
                let key = CandleKey::new(tick.symbol.clone(), interval);
                let bucket = bucket_start(ts, interval);

                if book.closed_through.get(&key).is_some_and(|&done| bucket <= done) {
                    debug!(key = %key, bucket, "late tick skipped for finalized bucket");
                    continue;
                }

                match book.open.get(&key).map(|c| c.bucket_start) {
                    Some(held) if held == bucket => {
                        if let Some(candle) = book.open.get_mut(&key) {
                            candle.apply(tick.price);
                            current.push(candle.clone());
                        }
                    }
                    Some(held) if held > bucket => {
                        debug!(key = %key, bucket, open_bucket = held, "out-of-order tick skipped");
                    }
                    _ => {
                        let fresh = Candle::opened(tick.symbol.clone(), interval, bucket, tick.price);
                        current.push(fresh.clone());
                        if let Some(prev) = book.open.insert(key, fresh) {
                            finalized.push(prev.completed());
                        }
                    }
                }
            }
            for done in &finalized {
                book.closed_through.insert(done.key(), done.bucket_start);
            }
        }

        if current.is_empty() && finalized.is_empty() {
            self.ticks_stale.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Stale;
        }

        self.latest_prices.write().insert(tick.symbol.clone(), tick.price);
        self.ticks_accepted.fetch_add(1, Ordering::Relaxed);

        if !finalized.is_empty() {
            self.persist_finalized(&finalized, FinalizeReason::Rollover).await;
        }
        self.persist_open(&current).await;

        TickOutcome::Applied
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Finalize every in-progress candle whose bucket ended at or before
    /// `now_secs`. Returns how many were finalized.
    pub async fn check_and_complete_candles(&self, now_secs: i64) -> usize {
        let expired: Vec<Candle> = {
            let mut book = self.book.lock();
            let keys: Vec<CandleKey> = book
                .open
                .iter()
                .filter(|(_, c)| now_secs >= c.bucket_end())
                .map(|(k, _)| k.clone())
                .collect();
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(candle) = book.open.remove(&key) {
                    book.closed_through.insert(key, candle.bucket_start);
                    out.push(candle.completed());
                }
            }
            out
        };

        if expired.is_empty() {
            return 0;
        }
        debug!(count = expired.len(), "sweep finalizing idle candles");
        self.persist_finalized(&expired, FinalizeReason::Sweep).await;
        expired.len()
    }

    /// Finalize and persist every in-progress candle, then clear all
    /// in-memory state. Failures are logged; the flush always runs to the end.
    pub async fn flush_all(&self) -> usize {
        let pending: Vec<Candle> = {
            let mut book = self.book.lock();
            let open = std::mem::take(&mut book.open);
            book.closed_through.clear();
            open.into_values().map(|c| c.completed()).collect()
        };

        if !pending.is_empty() {
            self.persist_finalized(&pending, FinalizeReason::Shutdown).await;
        }
        self.latest_prices.write().clear();
        info!(count = pending.len(), "in-progress candles flushed");
        pending.len()
    }

    /// Reject every later tick. Idempotent.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("candle aggregator no longer accepting ticks");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    async fn persist_open(&self, candles: &[Candle]) {
        let writes = candles.iter().map(|c| self.store.upsert(c));
        for (result, candle) in join_all(writes).await.into_iter().zip(candles) {
            if let Err(e) = result {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %candle.key(), bucket = candle.bucket_start, error = %e, "failed to persist in-progress candle");
            }
        }
    }

    async fn persist_finalized(&self, candles: &[Candle], reason: FinalizeReason) {
        let writes = candles.iter().map(|c| self.store.upsert(c));
        for (result, candle) in join_all(writes).await.into_iter().zip(candles) {
            match result {
                Ok(()) => debug!(key = %candle.key(), bucket = candle.bucket_start, ?reason, "candle finalized"),
                Err(e) => {
                    self.persist_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %candle.key(),
                        bucket = candle.bucket_start,
                        ?reason,
                        error = %e,
                        "failed to persist finalized candle"
                    );
                }
            }
            self.candles_finalized.fetch_add(1, Ordering::Relaxed);
            // No subscribers is fine.
            let _ = self.events.send(CandleEvent {
                candle: candle.clone(),
                reason,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Read side
    // -------------------------------------------------------------------------

    /// Snapshot of every in-progress candle, ordered by key.
    pub fn in_progress(&self) -> Vec<Candle> {
        let mut out: Vec<Candle> = self.book.lock().open.values().cloned().collect();
        out.sort_by(|a, b| (&a.symbol, a.interval).cmp(&(&b.symbol, b.interval)));
        out
    }

    pub fn in_progress_for(&self, symbol: &str) -> Vec<Candle> {
        let mut out: Vec<Candle> = self
            .book
            .lock()
            .open
            .values()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.interval);
        out
    }

    /// Last accepted price for `symbol`.
    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.latest_prices.read().get(symbol).copied()
    }

    /// Receive every candle finalized from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CandleEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            ticks_accepted: self.ticks_accepted.load(Ordering::Relaxed),
            ticks_rejected: self.ticks_rejected.load(Ordering::Relaxed),
            ticks_stale: self.ticks_stale.load(Ordering::Relaxed),
            candles_finalized: self.candles_finalized.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            in_progress: self.book.lock().open.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCandleStore, StoreStats};
    use anyhow::Result;
    use async_trait::async_trait;

    fn engine() -> (Arc<MemoryCandleStore>, CandleAggregator) {
        let store = Arc::new(MemoryCandleStore::new());
        let agg = CandleAggregator::new(store.clone(), PriceBounds::default());
        (store, agg)
    }

    fn tick(secs: i64, price: f64) -> Tick {
        Tick::new("OANDA:XAU_USD", price, secs * 1000)
    }

    #[tokio::test]
    async fn rollover_finalizes_previous_bucket() {
        let (store, agg) = engine();
        agg.handle_tick(&tick(0, 10.0)).await;
        agg.handle_tick(&tick(30, 12.0)).await;
        agg.handle_tick(&tick(65, 9.0)).await;

        let first = store.get("OANDA:XAU_USD", Interval::M1, 0).unwrap();
        assert!(first.is_complete);
        assert_eq!((first.open, first.high, first.low, first.close), (10.0, 12.0, 10.0, 12.0));
        assert_eq!(first.volume, 2.0);

        let second = store.get("OANDA:XAU_USD", Interval::M1, 60).unwrap();
        assert!(!second.is_complete);
        assert_eq!((second.open, second.high, second.low, second.close), (9.0, 9.0, 9.0, 9.0));

        // Longer intervals keep one candle spanning all three ticks.
        let five = store.get("OANDA:XAU_USD", Interval::M5, 0).unwrap();
        assert!(!five.is_complete);
        assert_eq!((five.open, five.high, five.low, five.close), (10.0, 12.0, 9.0, 9.0));
        assert_eq!(five.volume, 3.0);
    }

    #[tokio::test]
    async fn every_tick_persists_open_candles() {
        let (store, agg) = engine();
        assert_eq!(agg.handle_tick(&tick(1, 100.0)).await, TickOutcome::Applied);
        assert_eq!(store.len(), Interval::ALL.len());
        agg.handle_tick(&tick(2, 101.0)).await;
        let row = store.get("OANDA:XAU_USD", Interval::H4, 0).unwrap();
        assert_eq!(row.close, 101.0);
        assert_eq!(row.volume, 2.0);
        assert_eq!(agg.in_progress().len(), Interval::ALL.len());
        assert_eq!(agg.latest_price("OANDA:XAU_USD"), Some(101.0));
    }

    #[tokio::test]
    async fn invalid_prices_are_dropped() {
        let (store, agg) = engine();
        for bad in [f64::NAN, f64::INFINITY, 0.0, -5.0, 0.001, 2_000_000.0] {
            assert_eq!(agg.handle_tick(&tick(1, bad)).await, TickOutcome::Rejected);
        }
        assert_eq!(store.len(), 0);
        assert_eq!(agg.stats().ticks_rejected, 6);
        assert!(agg.in_progress().is_empty());
    }

    #[tokio::test]
    async fn sweep_finalizes_idle_candles_only_after_bucket_end() {
        let (store, agg) = engine();
        agg.handle_tick(&tick(10, 5.0)).await;

        assert_eq!(agg.check_and_complete_candles(59).await, 0);
        assert_eq!(agg.check_and_complete_candles(60).await, 1);
        assert!(store.get("OANDA:XAU_USD", Interval::M1, 0).unwrap().is_complete);
        assert!(!store.get("OANDA:XAU_USD", Interval::M5, 0).unwrap().is_complete);

        // 1m, 5m, 15m, 30m, 1h are all over by t=3600.
        assert_eq!(agg.check_and_complete_candles(3_600).await, 4);
        assert_eq!(agg.in_progress().len(), 2);
    }

    #[tokio::test]
    async fn tick_older_than_every_bucket_is_stale() {
        let (_store, agg) = engine();
        assert_eq!(agg.handle_tick(&tick(100_000, 5.0)).await, TickOutcome::Applied);
        assert_eq!(agg.handle_tick(&tick(10, 9.0)).await, TickOutcome::Stale);

        let stats = agg.stats();
        assert_eq!(stats.ticks_accepted, 1);
        assert_eq!(stats.ticks_stale, 1);
        assert_eq!(agg.latest_price("OANDA:XAU_USD"), Some(5.0));
        assert!(agg.in_progress().iter().all(|c| c.close == 5.0));
    }

    #[tokio::test]
    async fn late_tick_after_sweep_does_not_reopen_bucket() {
        let (store, agg) = engine();
        agg.handle_tick(&tick(10, 5.0)).await;
        agg.check_and_complete_candles(60).await;

        agg.handle_tick(&tick(50, 7.0)).await;
        let row = store.get("OANDA:XAU_USD", Interval::M1, 0).unwrap();
        assert!(row.is_complete);
        assert_eq!(row.close, 5.0);
        assert!(agg
            .in_progress_for("OANDA:XAU_USD")
            .iter()
            .all(|c| c.interval != Interval::M1));
        // Other intervals still took the tick.
        assert_eq!(store.get("OANDA:XAU_USD", Interval::M5, 0).unwrap().close, 7.0);
    }

    #[tokio::test]
    async fn shutdown_flush_persists_every_open_candle() {
        let (store, agg) = engine();
        agg.handle_tick(&tick(0, 1.0)).await;
        agg.handle_tick(&Tick::new("EURUSD", 1.08, 5_000)).await;
        let open = agg.in_progress().len();
        assert_eq!(open, 2 * Interval::ALL.len());

        agg.begin_shutdown();
        assert_eq!(agg.handle_tick(&tick(1, 2.0)).await, TickOutcome::ShuttingDown);

        assert_eq!(agg.flush_all().await, open);
        assert!(agg.in_progress().is_empty());
        let stats: StoreStats = store.stats().await.unwrap();
        assert_eq!(stats.total_candles as usize, open);
        assert!(store.incomplete_before(i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalized_candles_are_broadcast() {
        let (_store, agg) = engine();
        let mut rx = agg.subscribe();
        agg.handle_tick(&tick(0, 10.0)).await;
        agg.handle_tick(&tick(61, 11.0)).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, FinalizeReason::Rollover);
        assert_eq!(event.candle.interval, Interval::M1);
        assert_eq!(event.candle.bucket_start, 0);
        assert!(event.candle.is_complete);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ordered_ticks_give_monotone_consistent_candles() {
        let (_store, agg) = engine();
        let mut rx = agg.subscribe();

        // Deterministic pseudo-random walk.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut price = 2_000.0;
        let mut ts = 0;
        for _ in 0..400 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let step = ((seed >> 33) % 200) as f64 / 100.0 - 1.0;
            price = (price + step).max(1.0);
            ts += ((seed >> 20) % 90) as i64;
            agg.handle_tick(&tick(ts, price)).await;
        }
        agg.flush_all().await;

        let mut last: HashMap<Interval, i64> = HashMap::new();
        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            let c = event.candle;
            assert!(c.is_consistent(), "{c:?}");
            let prev = last.insert(c.interval, c.bucket_start);
            assert!(prev.map_or(true, |p| p < c.bucket_start), "{:?} after {prev:?}", event.reason);
            seen += 1;
        }
        assert!(seen > Interval::ALL.len());
    }

    struct FailingStore;

    #[async_trait]
    impl CandleStore for FailingStore {
        async fn upsert(&self, _: &Candle) -> Result<()> {
            anyhow::bail!("store unreachable")
        }
        async fn range_query(&self, _: &str, _: Interval, _: i64, _: i64, _: Option<usize>) -> Result<Vec<Candle>> {
            anyhow::bail!("store unreachable")
        }
        async fn latest(&self, _: &str, _: Interval, _: usize) -> Result<Vec<Candle>> {
            anyhow::bail!("store unreachable")
        }
        async fn mark_complete(&self, _: &str, _: Interval, _: i64) -> Result<bool> {
            anyhow::bail!("store unreachable")
        }
        async fn delete_older_than(&self, _: i64) -> Result<usize> {
            anyhow::bail!("store unreachable")
        }
        async fn incomplete_before(&self, _: i64) -> Result<Vec<Candle>> {
            anyhow::bail!("store unreachable")
        }
        async fn stats(&self) -> Result<StoreStats> {
            anyhow::bail!("store unreachable")
        }
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let agg = CandleAggregator::new(Arc::new(FailingStore), PriceBounds::default());
        assert_eq!(agg.handle_tick(&tick(0, 3.0)).await, TickOutcome::Applied);
        assert_eq!(agg.handle_tick(&tick(61, 4.0)).await, TickOutcome::Applied);
        let stats = agg.stats();
        assert!(stats.persist_failures > 0);
        assert_eq!(stats.ticks_accepted, 2);
        assert_eq!(agg.in_progress().len(), Interval::ALL.len());
        assert_eq!(agg.flush_all().await, Interval::ALL.len());
    }
}
