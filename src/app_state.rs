// =============================================================================
// Central Application State — candle pipeline
// =============================================================================
//
// Ties the pipeline components together for the HTTP layer. Each component
// manages its own interior mutability; AppState only holds `Arc`s to them.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::history::HistoryResolver;
use crate::market_data::CandleAggregator;
use crate::market_hours::MarketSchedule;
use crate::runtime_config::PipelineConfig;
use crate::store::CandleStore;

/// Shared across all request handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: PipelineConfig,

    pub aggregator: Arc<CandleAggregator>,
    pub resolver: Arc<HistoryResolver>,
    pub store: Arc<dyn CandleStore>,
    pub schedule: MarketSchedule,

    pub started_at: Instant,

    /// Websocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,
}

impl AppState {
    pub fn new(
        config: PipelineConfig,
        aggregator: Arc<CandleAggregator>,
        resolver: Arc<HistoryResolver>,
        store: Arc<dyn CandleStore>,
    ) -> Self {
        let schedule = config.schedule();
        Self {
            config,
            aggregator,
            resolver,
            store,
            schedule,
            started_at: Instant::now(),
            ws_sequence_number: AtomicU64::new(0),
        }
    }

    pub fn next_ws_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
