// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are public: this is a read-only
// request layer over the candle pipeline.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::calendar::Interval;
use crate::history::HistoryRequest;
use crate::market_data::aggregator::AggregatorStats;
use crate::store::StoreStats;
use crate::types::Candle;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg.into() })),
    )
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/history", get(history))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/candles/live", get(live_candles))
        .route("/api/v1/market-status", get(market_status))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: u64,
    shutting_down: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shutting_down = state.aggregator.is_shutting_down();
    let resp = HealthResponse {
        status: if shutting_down { "stopping" } else { "ok" },
        server_time: Utc::now().timestamp_millis(),
        uptime_secs: state.uptime_secs(),
        shutting_down,
    };
    Json(resp)
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    symbol: String,
    resolution: String,
    from: i64,
    to: i64,
    #[serde(default)]
    countback: Option<usize>,
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let interval = Interval::from_resolution(&q.resolution).map_err(|e| bad_request(e.to_string()))?;
    if q.from > q.to {
        return Err(bad_request(format!("from ({}) is after to ({})", q.from, q.to)));
    }
    let symbol = q.symbol.trim();
    if symbol.is_empty() {
        return Err(bad_request("symbol is required"));
    }

    let req = HistoryRequest::new(symbol, interval, q.from, q.to).with_count_back(q.countback.filter(|&n| n > 0));
    let resp = state.resolver.get_historical_data(&req, Utc::now()).await;
    Ok(Json(resp))
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Serialize)]
struct StatsResponse {
    store: StoreStats,
    aggregator: AggregatorStats,
    history_cache_entries: usize,
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.stats().await.map_err(|e| {
        warn!(error = %e, "store stats failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "store unavailable" })),
        )
    })?;
    Ok(Json(StatsResponse {
        store,
        aggregator: state.aggregator.stats(),
        history_cache_entries: state.resolver.cache().len(),
    }))
}

// =============================================================================
// Live (in-progress) candles
// =============================================================================

#[derive(Deserialize)]
struct LiveQuery {
    symbol: Option<String>,
}

#[derive(Serialize)]
struct LiveResponse {
    candles: Vec<Candle>,
    latest_price: Option<f64>,
}

async fn live_candles(State(state): State<Arc<AppState>>, Query(q): Query<LiveQuery>) -> impl IntoResponse {
    let resp = match q.symbol.as_deref() {
        Some(symbol) => LiveResponse {
            candles: state.aggregator.in_progress_for(symbol),
            latest_price: state.aggregator.latest_price(symbol),
        },
        None => LiveResponse {
            candles: state.aggregator.in_progress(),
            latest_price: None,
        },
    };
    Json(resp)
}

// =============================================================================
// Market status
// =============================================================================

async fn market_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.resolver.market_status(Utc::now()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;

    use crate::history::HistoryResolver;
    use crate::market_data::{CandleAggregator, PriceBounds};
    use crate::runtime_config::PipelineConfig;
    use crate::store::{CandleStore, MemoryCandleStore};
    use crate::types::Tick;

    fn state_with(store: Arc<MemoryCandleStore>) -> Arc<AppState> {
        let config = PipelineConfig::default();
        let aggregator = Arc::new(CandleAggregator::new(store.clone(), PriceBounds::default()));
        let resolver = Arc::new(HistoryResolver::new(
            store.clone(),
            None,
            config.schedule(),
            config.resolver_settings(),
        ));
        Arc::new(AppState::new(config, aggregator, resolver, store))
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    // Wednesday 2024-01-10 12:00 UTC, far from any recent session close.
    fn base() -> i64 {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap().timestamp()
    }

    #[tokio::test]
    async fn health_ok() {
        let (status, body) = get(state_with(Arc::new(MemoryCandleStore::new())), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["shutting_down"], false);
    }

    #[tokio::test]
    async fn history_returns_bars_and_no_data() {
        let store = Arc::new(MemoryCandleStore::new());
        for i in 0..3 {
            let c = Candle::opened("OANDA:EUR_USD", Interval::M5, base() + i * 300, 1.08);
            store.upsert(&c.completed()).await.unwrap();
        }
        let state = state_with(store);

        let uri = format!(
            "/api/v1/history?symbol=OANDA:EUR_USD&resolution=5&from={}&to={}",
            base(),
            base() + 3_600
        );
        let (status, body) = get(state.clone(), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["s"], "ok");
        assert_eq!(body["t"].as_array().unwrap().len(), 3);
        assert_eq!(body["t"][0], base());

        let uri = format!(
            "/api/v1/history?symbol=OANDA:GBP_USD&resolution=5&from={}&to={}",
            base(),
            base() + 3_600
        );
        let (status, body) = get(state, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "s": "no_data" }));
    }

    #[tokio::test]
    async fn history_rejects_bad_input() {
        let state = state_with(Arc::new(MemoryCandleStore::new()));
        let (status, body) = get(state.clone(), "/api/v1/history?symbol=X&resolution=7&from=0&to=60").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = get(state, "/api/v1/history?symbol=X&resolution=1&from=120&to=60").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn live_candles_and_stats() {
        let store = Arc::new(MemoryCandleStore::new());
        let state = state_with(store);
        state.aggregator.handle_tick(&Tick::new("BINANCE:BTCUSDT", 42_000.0, base() * 1000)).await;

        let (status, body) = get(state.clone(), "/api/v1/candles/live?symbol=BINANCE:BTCUSDT").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candles"].as_array().unwrap().len(), Interval::ALL.len());
        assert_eq!(body["latest_price"], 42_000.0);

        let (status, body) = get(state, "/api/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"]["total_candles"], 7);
        assert_eq!(body["aggregator"]["ticks_accepted"], 1);
    }

    #[tokio::test]
    async fn market_status_shape() {
        let (status, body) = get(state_with(Arc::new(MemoryCandleStore::new())), "/api/v1/market-status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["is_open"].is_boolean());
        assert!(body["session_close"].as_i64().unwrap() > body["session_open"].as_i64().unwrap());
    }
}
