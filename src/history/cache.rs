// =============================================================================
// History cache — short-lived memo of recent query results
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::bars::{BarSeries, HistoryRequest};
use crate::calendar::Interval;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub symbol: String,
    pub interval: Interval,
    pub from: i64,
    pub to: i64,
}

impl From<&HistoryRequest> for CacheKey {
    fn from(req: &HistoryRequest) -> Self {
        Self {
            symbol: req.symbol.clone(),
            interval: req.interval,
            from: req.from,
            to: req.to,
        }
    }
}

/// TTL cache keyed by `(symbol, interval, from, to)`. Expired entries are
/// pruned whenever a new entry is inserted.
pub struct HistoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, BarSeries)>>,
}

impl HistoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<BarSeries> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, bars)| bars.clone())
    }

    pub fn insert(&self, key: CacheKey, bars: BarSeries) {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        entries.insert(key, (Instant::now(), bars));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
