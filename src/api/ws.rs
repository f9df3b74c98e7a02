// =============================================================================
// WebSocket Handler — push of finalized candles
// =============================================================================
//
// Clients connect to `/api/v1/ws` (optionally `?symbol=<symbol>`) and receive
// one JSON frame per finalized candle:
//
//   { "seq": 12, "reason": "rollover", "candle": { ... } }
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Skips ahead when it lags behind the broadcast channel.
//   - Closes when the aggregator drops its sender.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::aggregator::{CandleEvent, FinalizeReason};
use crate::types::Candle;

#[derive(Deserialize)]
pub struct WsQuery {
    symbol: Option<String>,
}

#[derive(Serialize)]
struct CandleFrame<'a> {
    seq: u64,
    reason: FinalizeReason,
    candle: &'a Candle,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    info!(symbol = ?query.symbol, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.symbol))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs the push side (broadcast receiver) and the recv side (client frames)
/// concurrently via `tokio::select!` until either side ends.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, symbol: Option<String>) {
    let mut events = state.aggregator.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !wanted(&event, symbol.as_deref()) {
                            continue;
                        }
                        if let Err(e) = send_event(&mut sender, &state, &event).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging, events skipped");
                    }
                    Err(RecvError::Closed) => {
                        info!("candle event channel closed — disconnecting");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    // Text / Binary / Pong: nothing to do.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

fn wanted(event: &CandleEvent, symbol: Option<&str>) -> bool {
    symbol.map_or(true, |s| event.candle.symbol.eq_ignore_ascii_case(s))
}

async fn send_event<S>(sender: &mut S, state: &AppState, event: &CandleEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = CandleFrame {
        seq: state.next_ws_sequence(),
        reason: event.reason,
        candle: &event.candle,
    };

    match serde_json::to_string(&frame) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(seq = frame.seq, key = %event.candle.key(), "candle event sent");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize candle event");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Interval;

    #[test]
    fn symbol_filter() {
        let event = CandleEvent {
            candle: Candle::opened("OANDA:XAU_USD", Interval::M1, 0, 2_000.0),
            reason: FinalizeReason::Rollover,
        };
        assert!(wanted(&event, None));
        assert!(wanted(&event, Some("oanda:xau_usd")));
        assert!(!wanted(&event, Some("OANDA:EUR_USD")));
    }

    #[test]
    fn frame_shape() {
        let candle = Candle::opened("X", Interval::M5, 300, 1.5).completed();
        let frame = CandleFrame {
            seq: 3,
            reason: FinalizeReason::Sweep,
            candle: &candle,
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["seq"], 3);
        assert_eq!(v["reason"], "sweep");
        assert_eq!(v["candle"]["bucket_start"], 300);
        assert_eq!(v["candle"]["is_complete"], true);
    }
}
