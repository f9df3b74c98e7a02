// =============================================================================
// Finnhub REST client — historical candle ranges
// =============================================================================
//
// SECURITY: the API token is sent as a query parameter and is never logged or
// printed through `Debug`.
//
// Response shape for every candle endpoint:
//   { "s": "ok", "t": [...], "o": [...], "h": [...], "l": [...], "c": [...], "v": [...] }
//   { "s": "no_data" }
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{HistoricalProvider, ProviderBars};
use crate::calendar::Interval;

pub const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1";

/// Exchange prefixes that Finnhub serves from its crypto endpoint.
const CRYPTO_EXCHANGES: &[&str] = &["BINANCE", "COINBASE", "KRAKEN", "BITFINEX", "GEMINI", "POLONIEX", "HUOBI"];

#[derive(Clone)]
pub struct FinnhubClient {
    token: String,
    base_url: String,
    client: reqwest::Client,
}

impl FinnhubClient {
    pub fn new(token: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        debug!(base_url = %base_url, "FinnhubClient initialised");

        Ok(Self {
            token: token.into(),
            base_url,
            client,
        })
    }

    /// Candle endpoint for a symbol: `OANDA:XAU_USD` is forex,
    /// `BINANCE:BTCUSDT` is crypto, a bare ticker is a stock.
    fn endpoint(symbol: &str) -> &'static str {
        match symbol.split_once(':') {
            Some((exchange, _)) if CRYPTO_EXCHANGES.contains(&exchange.to_ascii_uppercase().as_str()) => {
                "crypto/candle"
            }
            Some(_) => "forex/candle",
            None => "stock/candle",
        }
    }

    /// Turn a raw response body into bars. Malformed payloads are logged and
    /// reported as "nothing available".
    fn parse_body(symbol: &str, body: serde_json::Value) -> Result<Option<ProviderBars>> {
        match body["s"].as_str() {
            Some("ok") => {}
            Some("no_data") => return Ok(None),
            other => anyhow::bail!("unexpected candle status {other:?} for {symbol}"),
        }

        let bars: ProviderBars = match serde_json::from_value(body) {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "malformed candle payload dropped");
                return Ok(None);
            }
        };
        if let Err(e) = bars.validate() {
            warn!(symbol, error = %e, "invalid candle payload dropped");
            return Ok(None);
        }
        if bars.is_empty() {
            return Ok(None);
        }
        Ok(Some(bars))
    }
}

#[async_trait]
impl HistoricalProvider for FinnhubClient {
    fn name(&self) -> &str {
        "finnhub"
    }

    /// GET /{forex,crypto,stock}/candle
    #[instrument(skip(self), name = "finnhub::fetch")]
    async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Option<ProviderBars>> {
        let endpoint = Self::endpoint(symbol);
        let url = format!("{}/{}", self.base_url, endpoint);
        let from_s = from.to_string();
        let to_s = to.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("resolution", interval.provider_resolution()),
                ("from", from_s.as_str()),
                ("to", to_s.as_str()),
                ("token", self.token.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("GET /{endpoint} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse /{endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Finnhub GET /{} returned {}: {}", endpoint, status, body);
        }

        let bars = Self::parse_body(symbol, body)?;
        debug!(symbol, interval = %interval, count = bars.as_ref().map_or(0, ProviderBars::len), "candles fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for FinnhubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinnhubClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
