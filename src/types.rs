// =============================================================================
// Shared types used across the candle pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::calendar::{bucket_end, Interval};

/// A single price observation from the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    /// Epoch milliseconds.
    pub timestamp_ms: i64,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp_ms,
        }
    }

    /// Tick time floored to whole seconds.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// Where a persisted candle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    Stream,
    Provider,
    Derived,
}

impl CandleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Provider => "provider",
            Self::Derived => "derived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stream" => Some(Self::Stream),
            "provider" => Some(Self::Provider),
            "derived" => Some(Self::Derived),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key that identifies one in-progress candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: Interval,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// One OHLCV candle, unique per `(symbol, interval, bucket_start)`.
///
/// `volume` counts accepted ticks. It is a liquidity proxy, not traded size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    /// Epoch seconds, always a multiple of `interval.duration_secs()`.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source: CandleSource,
    pub is_complete: bool,
}

impl Candle {
    /// A fresh stream candle seeded by its first tick.
    pub fn opened(symbol: impl Into<String>, interval: Interval, bucket_start: i64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
            source: CandleSource::Stream,
            is_complete: false,
        }
    }

    /// Fold another tick of the same bucket into the candle.
    pub fn apply(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += 1.0;
    }

    pub fn key(&self) -> CandleKey {
        CandleKey::new(self.symbol.clone(), self.interval)
    }

    pub fn bucket_end(&self) -> i64 {
        bucket_end(self.bucket_start, self.interval)
    }

    /// `low <= open, close <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }

    /// Finalized copy of this candle.
    pub fn completed(&self) -> Self {
        Self {
            is_complete: true,
            ..self.clone()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
