// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used: the depth snapshot that seeds the
// local order book and the kline history that seeds the candle series. Every
// response updates the request-weight tracker; a request that would exceed
// the per-minute budget fails fast so callers can back off.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::{depth_request_weight, RateLimitTracker, KLINES_REQUEST_WEIGHT};
use crate::market_data::{Candle, OrderBookSnapshot};
use crate::types::{Pair, Timeframe};

/// REST operations the feed depends on. The reconciler fetches snapshots
/// through this seam; the connection manager fetches history.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// `GET /depth?symbol=<PAIR>&limit=<limit>`.
    async fn depth_snapshot(&self, pair: &Pair, limit: u32) -> Result<OrderBookSnapshot>;

    /// `GET /klines?symbol=<PAIR>&interval=<interval>&limit=<limit>`.
    async fn klines(&self, pair: &Pair, timeframe: Timeframe, limit: u32) -> Result<Vec<Candle>>;
}

#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    /// Create a client against `base_url` (e.g. `https://api.binance.com/api/v3`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    /// Issue a GET, record the weight header and return the JSON body.
    async fn get_json(&self, path: &str, weight: u32) -> Result<serde_json::Value> {
        if !self.rate_limit.can_send_request(weight) {
            anyhow::bail!("GET {path} deferred: request weight budget exhausted");
        }

        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", path, status, body);
        }

        Ok(body)
    }
}

#[async_trait]
impl MarketDataApi for BinanceClient {
    #[instrument(skip(self, pair), fields(pair = %pair), name = "binance::depth_snapshot")]
    async fn depth_snapshot(&self, pair: &Pair, limit: u32) -> Result<OrderBookSnapshot> {
        let path = format!("/depth?symbol={}&limit={}", pair.rest_symbol(), limit);
        let body = self.get_json(&path, depth_request_weight(limit)).await?;

        let snapshot: OrderBookSnapshot =
            serde_json::from_value(body).context("malformed depth snapshot")?;

        debug!(
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "depth snapshot fetched"
        );
        Ok(snapshot)
    }

    #[instrument(skip(self, pair, timeframe), fields(pair = %pair, interval = %timeframe), name = "binance::klines")]
    async fn klines(&self, pair: &Pair, timeframe: Timeframe, limit: u32) -> Result<Vec<Candle>> {
        let path = format!(
            "/klines?symbol={}&interval={}&limit={}",
            pair.rest_symbol(),
            timeframe.as_str(),
            limit
        );
        let body = self.get_json(&path, KLINES_REQUEST_WEIGHT).await?;
        let candles = parse_kline_rows(&body, Utc::now().timestamp_millis())?;

        debug!(count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

/// Parse the array-of-arrays klines body. Malformed rows are skipped.
fn parse_kline_rows(body: &serde_json::Value, now_ms: i64) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        match Candle::from_rest_row(entry, now_ms) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!(error = %e, "skipping malformed kline entry"),
        }
    }
    Ok(candles)
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_rows_skip_malformed_entries() {
        let body = serde_json::json!([
            [0, "1", "2", "0.5", "1.5", "10", 59_999, "15", 3],
            ["bad"],
            [60_000, "1.5", "2", "1", "1.8", "4", 119_999, "7", 1]
        ]);
        let candles = parse_kline_rows(&body, 1_000_000).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].open_time, 60_000);
    }

    #[test]
    fn kline_body_must_be_array() {
        let body = serde_json::json!({ "code": -1121, "msg": "Invalid symbol." });
        assert!(parse_kline_rows(&body, 0).is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = BinanceClient::new("https://api.binance.com/api/v3/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "https://api.binance.com/api/v3");
    }
}
