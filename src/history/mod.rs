pub mod bars;
pub mod cache;
pub mod resolver;

pub use bars::{BarSeries, HistoryRequest, HistoryResponse};
pub use cache::HistoryCache;
pub use resolver::{HistoryResolver, MarketStatus, ResolverSettings};
