// =============================================================================
// Tick Stream — upstream price feed reader and ingestion loop
// =============================================================================
//
// The reader owns the websocket and never waits on the store: ticks are
// handed to the ingestion task through a bounded channel with `try_send`, so
// a slow store fills the queue and drops ticks instead of stalling the socket.
//
// The ingestion task drains the channel in delivery order, which keeps
// per-symbol tick order intact.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::aggregator::{CandleAggregator, TickOutcome};
use crate::types::Tick;

/// Wire format of feed messages:
/// ```json
/// { "type": "trade", "data": [ { "s": "OANDA:XAU_USD", "p": 2034.12, "t": 1700000000123, "v": 0 } ] }
/// { "type": "ping" }
/// ```
#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<FeedTrade>,
}

#[derive(Debug, Deserialize)]
struct FeedTrade {
    s: String,
    p: f64,
    t: i64,
}

/// Parse one feed message into ticks. Non-trade messages yield nothing.
fn parse_feed_message(text: &str) -> Result<Vec<Tick>> {
    let msg: FeedMessage = serde_json::from_str(text).context("failed to parse feed JSON")?;
    if msg.kind != "trade" {
        return Ok(Vec::new());
    }
    Ok(msg
        .data
        .into_iter()
        .map(|t| Tick::new(t.s, t.p, t.t))
        .collect())
}

fn subscribe_message(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

/// Log-safe form of a feed URL (query string holds the token).
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Connect to the feed, subscribe to `symbols`, and forward ticks into `tx`.
///
/// Runs until the socket closes or errors, then returns so the caller can
/// reconnect. Returns `Ok(())` early when the ingestion side hung up.
pub async fn run_tick_stream(url: &str, symbols: &[String], tx: &mpsc::Sender<Tick>) -> Result<()> {
    info!(url = %redact(url), symbols = ?symbols, "connecting to tick feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to tick feed")?;
    let (mut write, mut read) = ws_stream.split();

    for symbol in symbols {
        write
            .send(Message::Text(subscribe_message(symbol)))
            .await
            .with_context(|| format!("failed to subscribe to {symbol}"))?;
    }
    info!(count = symbols.len(), "tick feed connected and subscribed");

    let mut dropped: u64 = 0;
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let ticks = match parse_feed_message(&text) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to parse feed message");
                        continue;
                    }
                };
                for tick in ticks {
                    match tx.try_send(tick) {
                        Ok(()) => {}
                        Err(TrySendError::Full(t)) => {
                            dropped += 1;
                            warn!(symbol = %t.symbol, dropped, "tick queue full, tick dropped");
                        }
                        Err(TrySendError::Closed(_)) => {
                            info!("ingestion stopped, closing tick feed");
                            return Ok(());
                        }
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "tick feed closed by server");
                return Ok(());
            }
            // Ping / Pong / Binary; tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "tick feed read error");
                return Err(e.into());
            }
            None => {
                warn!("tick feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Drain `rx` in order into the aggregator until every sender is gone.
/// Returns the number of ticks applied.
pub async fn run_ingestion(mut rx: mpsc::Receiver<Tick>, aggregator: Arc<CandleAggregator>) -> u64 {
    let mut applied = 0;
    while let Some(tick) = rx.recv().await {
        match aggregator.handle_tick(&tick).await {
            TickOutcome::Applied => applied += 1,
            TickOutcome::Rejected | TickOutcome::Stale => {}
            TickOutcome::ShuttingDown => {
                debug!("aggregator shutting down, discarding queued ticks");
                rx.close();
            }
        }
    }
    info!(applied, "tick ingestion finished");
    applied
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::aggregator::PriceBounds;
    use crate::store::MemoryCandleStore;

    #[test]
    fn parse_trade_batch() {
        let json = r#"{"type":"trade","data":[
            {"s":"OANDA:XAU_USD","p":2034.12,"t":1700000000123,"v":0},
            {"s":"OANDA:EUR_USD","p":1.0801,"t":1700000000456,"v":0}
        ]}"#;
        let ticks = parse_feed_message(json).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0], Tick::new("OANDA:XAU_USD", 2034.12, 1_700_000_000_123));
        assert_eq!(ticks[1].timestamp_secs(), 1_700_000_000);
    }

    #[test]
    fn ping_and_unknown_messages_yield_nothing() {
        assert!(parse_feed_message(r#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(parse_feed_message(r#"{"type":"news","data":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"type":"trade","data":[{"s":"X"}]}"#).is_err());
    }

    #[test]
    fn subscribe_payload_and_redaction() {
        assert_eq!(
            subscribe_message("OANDA:XAU_USD"),
            r#"{"symbol":"OANDA:XAU_USD","type":"subscribe"}"#
        );
        assert_eq!(redact("wss://ws.finnhub.io?token=abc"), "wss://ws.finnhub.io");
    }

    #[tokio::test]
    async fn ingestion_applies_ticks_in_order() {
        let store = Arc::new(MemoryCandleStore::new());
        let agg = Arc::new(CandleAggregator::new(store.clone(), PriceBounds::default()));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_ingestion(rx, agg.clone()));

        tx.send(Tick::new("EURUSD", 1.08, 0)).await.unwrap();
        tx.send(Tick::new("EURUSD", 1.09, 10_000)).await.unwrap();
        tx.send(Tick::new("EURUSD", -1.0, 20_000)).await.unwrap();
        tx.send(Tick::new("EURUSD", 1.07, 30_000)).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), 3);
        let row = store.get("EURUSD", crate::calendar::Interval::M1, 0).unwrap();
        assert_eq!((row.open, row.high, row.low, row.close), (1.08, 1.09, 1.07, 1.07));
    }
}
