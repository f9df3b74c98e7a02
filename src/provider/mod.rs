// =============================================================================
// Historical Provider — upstream OHLCV range queries
// =============================================================================

pub mod finnhub;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::calendar::{bucket_start, Interval};
use crate::types::{Candle, CandleSource};

pub use finnhub::FinnhubClient;

/// Parallel OHLCV arrays as returned by the upstream provider.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderBars {
    #[serde(rename = "t", default)]
    pub times: Vec<i64>,
    #[serde(rename = "o", default)]
    pub opens: Vec<f64>,
    #[serde(rename = "h", default)]
    pub highs: Vec<f64>,
    #[serde(rename = "l", default)]
    pub lows: Vec<f64>,
    #[serde(rename = "c", default)]
    pub closes: Vec<f64>,
    #[serde(rename = "v", default)]
    pub volumes: Vec<f64>,
}

impl ProviderBars {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Reject responses whose arrays disagree in length or carry prices that
    /// could never come from a real market.
    pub fn validate(&self) -> Result<()> {
        let n = self.times.len();
        for (name, len) in [
            ("o", self.opens.len()),
            ("h", self.highs.len()),
            ("l", self.lows.len()),
            ("c", self.closes.len()),
        ] {
            if len != n {
                anyhow::bail!("provider array {name} has {len} entries, expected {n}");
            }
        }
        if !self.volumes.is_empty() && self.volumes.len() != n {
            anyhow::bail!("provider array v has {} entries, expected {n}", self.volumes.len());
        }
        let prices = self.opens.iter().chain(&self.highs).chain(&self.lows).chain(&self.closes);
        if let Some(bad) = prices.copied().find(|p| !p.is_finite() || *p <= 0.0) {
            anyhow::bail!("provider returned invalid price {bad}");
        }
        Ok(())
    }

    /// Convert into complete provider-sourced candles, realigning each time
    /// to its bucket start. Bars violating the OHLC ordering are skipped.
    pub fn into_candles(self, symbol: &str, interval: Interval) -> Vec<Candle> {
        let mut out = Vec::with_capacity(self.times.len());
        for i in 0..self.times.len() {
            let candle = Candle {
                symbol: symbol.to_string(),
                interval,
                bucket_start: bucket_start(self.times[i], interval),
                open: self.opens[i],
                high: self.highs[i],
                low: self.lows[i],
                close: self.closes[i],
                volume: self.volumes.get(i).copied().unwrap_or(0.0).max(0.0),
                source: CandleSource::Provider,
                is_complete: true,
            };
            if candle.is_consistent() {
                out.push(candle);
            } else {
                warn!(symbol, interval = %interval, time = self.times[i], "dropping inconsistent provider bar");
            }
        }
        out.sort_by_key(|c| c.bucket_start);
        out.dedup_by_key(|c| c.bucket_start);
        out
    }
}

#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    /// Provider name (for logging).
    fn name(&self) -> &str;

    /// Fetch bars for `[from, to]` (epoch seconds). `Ok(None)` means the
    /// provider has nothing for that range.
    async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Option<ProviderBars>>;
}

// =============================================================================
// Tests
// =============================================================================
