// =============================================================================
// History Resolver — cache, then store, then upstream provider
// =============================================================================
//
// Lookup order for `get_historical_data`:
//   1. cache, keyed on the caller's raw window
//   2. closed-market substitution: while the market is shut, a window that
//      reaches past the last session close is clamped to that session
//   3. store range query, sufficient when it holds at least `count_back` rows
//   4. provider fetch (bounded by a timeout), back-filled into the store
//   5. `NoData`
//
// Only the store and provider are ever touched here; the in-progress candles
// of the aggregator are never read or written by the query path.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bars::{BarSeries, HistoryRequest, HistoryResponse};
use super::cache::{CacheKey, HistoryCache};
use crate::calendar::Interval;
use crate::market_hours::{MarketSchedule, SessionWindow};
use crate::provider::HistoricalProvider;
use crate::store::CandleStore;
use crate::types::Candle;

#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub cache_ttl: Duration,
    pub provider_timeout: Duration,
    /// Bar count used when a closed-market query must fall back to the most
    /// recent rows and the caller gave no `count_back`.
    pub default_count_back: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(10),
            default_count_back: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarketStatus {
    pub is_open: bool,
    pub server_time: i64,
    pub session_open: i64,
    pub session_close: i64,
}

/// Window actually looked up after closed-market adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Range { from: i64, to: i64 },
    /// Adjusted window came out inverted: serve the most recent rows.
    Latest { session: SessionWindow },
}

pub struct HistoryResolver {
    store: Arc<dyn CandleStore>,
    provider: Option<Arc<dyn HistoricalProvider>>,
    schedule: MarketSchedule,
    cache: HistoryCache,
    settings: ResolverSettings,
}

impl HistoryResolver {
    pub fn new(
        store: Arc<dyn CandleStore>,
        provider: Option<Arc<dyn HistoricalProvider>>,
        schedule: MarketSchedule,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            provider,
            schedule,
            cache: HistoryCache::new(settings.cache_ttl),
            settings,
        }
    }

    pub fn market_status(&self, now: DateTime<Utc>) -> MarketStatus {
        let session = self.schedule.last_session(now);
        MarketStatus {
            is_open: self.schedule.is_open(now),
            server_time: now.timestamp(),
            session_open: session.open,
            session_close: session.close,
        }
    }

    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    /// Bars for `req`, or `NoData` when neither the store nor the provider
    /// has anything. Never fails: store and provider errors are logged and
    /// treated as empty.
    pub async fn get_historical_data(&self, req: &HistoryRequest, now: DateTime<Utc>) -> HistoryResponse {
        let key = CacheKey::from(req);
        if let Some(bars) = self.cache.get(&key) {
            debug!(symbol = %req.symbol, interval = %req.interval, "history cache hit");
            return HistoryResponse::Ok(bars);
        }

        let now_secs = now.timestamp();
        let candles = match self.adjusted_window(req, now) {
            Window::Range { from, to } => self.lookup(req, from, to, now_secs).await,
            Window::Latest { session } => {
                let n = req.count_back.unwrap_or(self.settings.default_count_back);
                match self.store.latest(&req.symbol, req.interval, n).await {
                    Ok(rows) if !rows.is_empty() => rows,
                    Ok(_) => self.lookup(req, session.open, session.close, now_secs).await,
                    Err(e) => {
                        warn!(symbol = %req.symbol, error = %e, "store latest query failed");
                        self.lookup(req, session.open, session.close, now_secs).await
                    }
                }
            }
        };

        if candles.is_empty() {
            debug!(symbol = %req.symbol, interval = %req.interval, from = req.from, to = req.to, "no history available");
            return HistoryResponse::NoData;
        }

        let bars = BarSeries::from_candles(&candles);
        self.cache.insert(key, bars.clone());
        HistoryResponse::Ok(bars)
    }

    fn adjusted_window(&self, req: &HistoryRequest, now: DateTime<Utc>) -> Window {
        if self.schedule.is_open(now) {
            return Window::Range { from: req.from, to: req.to };
        }
        let session = self.schedule.last_session(now);
        if req.to <= session.close {
            return Window::Range { from: req.from, to: req.to };
        }

        let from = req.from.max(session.open);
        let to = session.close;
        debug!(symbol = %req.symbol, from, to, "market closed, serving last session");
        if from > to {
            Window::Latest { session }
        } else {
            Window::Range { from, to }
        }
    }

    /// Store first, then the provider when the store falls short.
    async fn lookup(&self, req: &HistoryRequest, from: i64, to: i64, now: i64) -> Vec<Candle> {
        let stored = match self.store.range_query(&req.symbol, req.interval, from, to, None).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(symbol = %req.symbol, error = %e, "store range query failed");
                Vec::new()
            }
        };

        let sufficient = match req.count_back {
            Some(n) => stored.len() >= n,
            None => !stored.is_empty(),
        };
        if sufficient {
            return stored;
        }

        let fetched = self.fetch_and_backfill(req, from, to, now).await;
        if fetched.is_empty() {
            return stored;
        }
        merge(stored, fetched)
    }

    /// Provider bars for the window. Only buckets that ended by `now` are
    /// written back; a bar for a still-open bucket is returned as
    /// incomplete and never stored, so the live candle stays writable.
    async fn fetch_and_backfill(&self, req: &HistoryRequest, from: i64, to: i64, now: i64) -> Vec<Candle> {
        let Some(provider) = &self.provider else {
            return Vec::new();
        };
        let from = provider_from(from, to, req.interval, req.count_back);

        let fetch = provider.fetch(&req.symbol, req.interval, from, to);
        let bars = match tokio::time::timeout(self.settings.provider_timeout, fetch).await {
            Ok(Ok(Some(bars))) => bars,
            Ok(Ok(None)) => return Vec::new(),
            Ok(Err(e)) => {
                warn!(provider = provider.name(), symbol = %req.symbol, error = %e, "provider fetch failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(provider = provider.name(), symbol = %req.symbol, timeout = ?self.settings.provider_timeout, "provider fetch timed out");
                return Vec::new();
            }
        };

        let mut candles = bars.into_candles(&req.symbol, req.interval);
        for candle in candles.iter_mut().filter(|c| c.bucket_end() > now) {
            candle.is_complete = false;
        }
        let closed: Vec<Candle> = candles.iter().filter(|c| c.is_complete).cloned().collect();
        if !closed.is_empty() {
            match self.store.upsert_many(&closed).await {
                Ok(n) => info!(symbol = %req.symbol, interval = %req.interval, count = n, "back-filled provider history"),
                Err(e) => warn!(symbol = %req.symbol, error = %e, "history back-fill failed"),
            }
        }
        candles
    }
}

/// Widen the provider window so a `count_back` request can be satisfied in
/// one call.
fn provider_from(from: i64, to: i64, interval: Interval, count_back: Option<usize>) -> i64 {
    match count_back {
        Some(n) => {
            let span = interval.duration_secs().saturating_mul(n as i64);
            from.min(to.saturating_sub(span))
        }
        None => from,
    }
}

/// Union keyed by bucket start. Provider bars replace stored rows unless the
/// stored row is already complete. A provider bar for an open bucket only
/// fills a gap; the stored live candle wins.
fn merge(stored: Vec<Candle>, fetched: Vec<Candle>) -> Vec<Candle> {
    let mut by_time: BTreeMap<i64, Candle> = stored.into_iter().map(|c| (c.bucket_start, c)).collect();
    for candle in fetched {
        match by_time.get(&candle.bucket_start) {
            Some(existing) if existing.is_complete || !candle.is_complete => {}
            _ => {
                by_time.insert(candle.bucket_start, candle);
            }
        }
    }
    by_time.into_values().collect()
}

// =============================================================================
// Tests
// =============================================================================
