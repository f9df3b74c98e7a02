pub mod aggregator;
pub mod tick_stream;

pub use aggregator::{CandleAggregator, CandleEvent, PriceBounds, TickOutcome};
pub use tick_stream::{run_ingestion, run_tick_stream};
