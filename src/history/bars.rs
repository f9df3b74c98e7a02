// =============================================================================
// Bar series — chart-datafeed response shapes
// =============================================================================
//
//   { "s": "ok", "t": [...], "o": [...], "h": [...], "l": [...], "c": [...], "v": [...] }
//   { "s": "no_data" }
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::calendar::Interval;
use crate::types::Candle;

/// A history query as issued by the request layer. Times are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub symbol: String,
    pub interval: Interval,
    pub from: i64,
    pub to: i64,
    pub count_back: Option<usize>,
}

impl HistoryRequest {
    pub fn new(symbol: impl Into<String>, interval: Interval, from: i64, to: i64) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            from,
            to,
            count_back: None,
        }
    }

    pub fn with_count_back(mut self, count_back: Option<usize>) -> Self {
        self.count_back = count_back;
        self
    }
}

/// Parallel OHLCV arrays, ascending by time, all of equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    pub t: Vec<i64>,
    pub o: Vec<f64>,
    pub h: Vec<f64>,
    pub l: Vec<f64>,
    pub c: Vec<f64>,
    pub v: Vec<f64>,
}

impl BarSeries {
    /// Build from candles in any order. Duplicate bucket starts keep the
    /// last occurrence.
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut sorted: Vec<&Candle> = candles.iter().collect();
        sorted.sort_by_key(|c| c.bucket_start);

        let mut series = Self::default();
        for candle in sorted {
            if series.t.last() == Some(&candle.bucket_start) {
                series.pop();
            }
            series.t.push(candle.bucket_start);
            series.o.push(candle.open);
            series.h.push(candle.high);
            series.l.push(candle.low);
            series.c.push(candle.close);
            series.v.push(candle.volume);
        }
        series
    }

    fn pop(&mut self) {
        self.t.pop();
        self.o.pop();
        self.h.pop();
        self.l.pop();
        self.c.pop();
        self.v.pop();
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "s", rename_all = "snake_case")]
pub enum HistoryResponse {
    Ok(BarSeries),
    NoData,
}

impl HistoryResponse {
    pub fn bars(&self) -> Option<&BarSeries> {
        match self {
            Self::Ok(bars) => Some(bars),
            Self::NoData => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn series_is_sorted_and_deduplicated() {
        let mut a = Candle::opened("EURUSD", Interval::M1, 120, 1.1);
        a.apply(1.2);
        let b = Candle::opened("EURUSD", Interval::M1, 60, 1.0);
        let mut a2 = a.clone();
        a2.apply(1.15);

        let s = BarSeries::from_candles(&[a, b, a2]);
        assert_eq!(s.t, vec![60, 120]);
        assert_eq!(s.c, vec![1.0, 1.15]);
        assert_eq!(s.v, vec![1.0, 3.0]);
        assert!([s.o.len(), s.h.len(), s.l.len(), s.c.len(), s.v.len()].iter().all(|&n| n == 2));
    }

    #[test]
    fn wire_format() {
        let bars = BarSeries::from_candles(&[Candle::opened("X", Interval::M1, 60, 2.5)]);
        let ok = serde_json::to_value(HistoryResponse::Ok(bars)).unwrap();
        assert_eq!(
            ok,
            json!({ "s": "ok", "t": [60], "o": [2.5], "h": [2.5], "l": [2.5], "c": [2.5], "v": [1.0] })
        );

        let none = serde_json::to_value(HistoryResponse::NoData).unwrap();
        assert_eq!(none, json!({ "s": "no_data" }));
        let back: HistoryResponse = serde_json::from_value(none).unwrap();
        assert!(back.is_no_data());
    }
}
