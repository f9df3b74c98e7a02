// =============================================================================
// Candle Pipeline — Main Entry Point
// =============================================================================
//
// Ingests a live tick feed, builds OHLCV candles for every interval at once,
// persists them, and serves history over HTTP. Ctrl+C triggers a graceful
// shutdown that finalizes every in-progress candle before the store closes.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod calendar;
mod history;
mod lifecycle;
mod market_data;
mod market_hours;
mod provider;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::history::HistoryResolver;
use crate::lifecycle::Lifecycle;
use crate::market_data::CandleAggregator;
use crate::provider::{FinnhubClient, HistoricalProvider};
use crate::runtime_config::{PipelineConfig, DEFAULT_CONFIG_PATH};
use crate::store::{CandleStore, MemoryCandleStore, SqliteCandleStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Pipeline — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = PipelineConfig::load(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env();

    let api_key = std::env::var("FINNHUB_API_KEY").unwrap_or_default();
    info!(
        symbols = ?config.symbols,
        db_path = ?config.db_path,
        bind_addr = %config.bind_addr,
        "Configured candle pipeline"
    );

    // ── 2. Candle store ──────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = match &config.db_path {
        Some(path) => Arc::new(
            SqliteCandleStore::open(path, config.pool_size, config.store_timeout())
                .with_context(|| format!("failed to open candle store at {path}"))?,
        ),
        None => {
            warn!("db_path disabled — candles are kept in memory only");
            Arc::new(MemoryCandleStore::new())
        }
    };

    // ── 3. Historical provider ───────────────────────────────────────────
    let provider: Option<Arc<dyn HistoricalProvider>> = if api_key.is_empty() {
        warn!("FINNHUB_API_KEY not set — history is served from the store only");
        None
    } else {
        let client = FinnhubClient::new(api_key.clone(), config.provider_url.clone(), config.provider_timeout())?;
        Some(Arc::new(client))
    };

    // ── 4. Aggregator, resolver, lifecycle ───────────────────────────────
    let aggregator = Arc::new(CandleAggregator::new(store.clone(), config.price_bounds()));
    let resolver = Arc::new(HistoryResolver::new(
        store.clone(),
        provider,
        config.schedule(),
        config.resolver_settings(),
    ));
    let lifecycle = Lifecycle::start(aggregator.clone(), store.clone(), config.lifecycle_settings()).await;

    // ── 5. Tick feed + ingestion ─────────────────────────────────────────
    let (tick_tx, tick_rx) = mpsc::channel(config.tick_channel_capacity.max(1));
    let ingestion = tokio::spawn(market_data::run_ingestion(tick_rx, aggregator.clone()));

    let (feed_stop_tx, mut feed_stop_rx) = watch::channel(false);
    let feed_url = config.feed_url_with_token(&api_key);
    let symbols = config.symbols.clone();
    let feed = tokio::spawn(async move {
        loop {
            tokio::select! {
                res = market_data::run_tick_stream(&feed_url, &symbols, &tick_tx) => {
                    if let Err(e) = res {
                        error!(error = %e, "Tick stream error — reconnecting in 5s");
                    }
                }
                _ = feed_stop_rx.changed() => break,
            }
            if tick_tx.is_closed() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(5)) => {}
                _ = feed_stop_rx.changed() => break,
            }
        }
        info!("Tick feed stopped");
        // `tick_tx` drops here, which ends the ingestion task.
    });

    info!(count = config.symbols.len(), "Tick feed launched");

    // ── 6. Start the API server ──────────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone(), aggregator.clone(), resolver, store));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let (api_stop_tx, api_stop_rx) = watch::channel(false);
    let api = tokio::spawn(async move {
        let app = api::rest::router(state);
        let mut stop = api_stop_rx;
        let shutdown = async move {
            let _ = stop.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = feed_stop_tx.send(true);
    if let Err(e) = feed.await {
        error!(error = %e, "Tick feed task ended abnormally");
    }
    match ingestion.await {
        Ok(applied) => info!(applied, "Ingestion drained"),
        Err(e) => error!(error = %e, "Ingestion task ended abnormally"),
    }

    stop_serving(api_stop_tx, api, &lifecycle).await;

    info!(stats = ?aggregator.stats(), "Candle pipeline shut down complete.");
    Ok(())
}

/// Stop the API server, then finalize candles and close the store.
///
/// Requests still draining after the stop signal read the store, so it must
/// stay open until the server task has returned.
async fn stop_serving(api_stop_tx: watch::Sender<bool>, api: JoinHandle<()>, lifecycle: &Lifecycle) {
    let _ = api_stop_tx.send(true);
    if let Err(e) = api.await {
        error!(error = %e, "API task ended abnormally");
    }

    lifecycle.shutdown().await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::lifecycle::LifecycleSettings;
    use crate::market_data::PriceBounds;

    #[tokio::test]
    async fn draining_requests_see_an_open_store() {
        let store: Arc<dyn CandleStore> =
            Arc::new(SqliteCandleStore::in_memory(Duration::from_secs(5)).expect("in-memory sqlite"));
        let aggregator = Arc::new(CandleAggregator::new(store.clone(), PriceBounds::default()));
        let lifecycle = Lifecycle::start(aggregator, store.clone(), LifecycleSettings::default()).await;

        let (api_stop_tx, mut api_stop_rx) = watch::channel(false);
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let draining_store = store.clone();
        let api = tokio::spawn(async move {
            let _ = api_stop_rx.changed().await;
            // A request that was already in flight when the stop arrived.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = seen_tx.send(draining_store.stats().await.is_ok());
        });

        stop_serving(api_stop_tx, api, &lifecycle).await;

        assert!(seen_rx.await.unwrap());
        assert!(lifecycle.is_stopped());
        assert!(store.stats().await.is_err());
    }
}
