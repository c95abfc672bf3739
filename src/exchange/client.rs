// =============================================================================
// Bybit REST API Client — public v5 market endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used: kline history for backfilling the
// candle buffer and server time for clock-offset calibration.  Every v5
// response is wrapped in `{"retCode": 0, "retMsg": "OK", "result": ...}`; a
// non-zero retCode is an error even on HTTP 200.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::exchange::retry::retry_with_backoff;
use crate::market_data::candle_buffer::parse_string_f64;
use crate::market_data::{Candle, CandleBuffer, CandleKey};
use crate::runtime_config::ConnectionParams;
use crate::stream::auth::local_now_ms;

/// Bybit caps kline pages at 1000 bars.
pub const MAX_KLINE_LIMIT: usize = 1000;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Bybit REST client for public market data.
#[derive(Clone)]
pub struct BybitClient {
    base_url: String,
    category: String,
    client: reqwest::Client,
    limits: Arc<RateLimitTracker>,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client for `base_url` (e.g. `https://api.bybit.com`) on the
    /// linear (USDT perpetual) category.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        debug!(base_url = %base_url, "BybitClient initialised");

        Ok(Self {
            base_url,
            category: "linear".to_string(),
            client,
            limits: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn from_params(params: &ConnectionParams) -> Result<Self> {
        Self::new(params.rest_base_url(), params.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limits(&self) -> RateLimitSnapshot {
        self.limits.snapshot()
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// GET `path` and return the unwrapped `result` object.
    async fn get_result(&self, path: &str) -> Result<Value> {
        if !self.limits.can_send_request(local_now_ms()) {
            anyhow::bail!("Bybit GET {path} skipped: rate-limit budget exhausted");
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit GET {} returned {}: {}", path, status, body);
        }
        unwrap_result(path, body)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/time: venue clock in milliseconds.
    #[instrument(skip(self), name = "bybit::server_time")]
    pub async fn server_time_ms(&self) -> Result<i64> {
        let url = format!("{}/v5/market/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/time request failed")?;
        self.limits.update_from_headers(resp.headers());
        let body: Value = resp
            .json()
            .await
            .context("failed to parse server time response")?;
        parse_server_time(&body)
    }

    /// GET /v5/market/kline: most recent `limit` bars, oldest first.
    ///
    /// The venue returns newest first as arrays of strings:
    ///   [0] startTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] turnover
    /// The newest bar may still be forming; callers that need closed bars
    /// should drop it.
    #[instrument(skip(self), name = "bybit::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        let path = format!(
            "/v5/market/kline?category={}&symbol={}&interval={}&limit={}",
            self.category, symbol, interval, limit
        );
        let result = self.get_result(&path).await?;
        let candles = parse_kline_list(&result)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Fill `buffer` with the closed history of `symbol`/`interval`.
    ///
    /// Returns the number of bars inserted.
    #[instrument(skip(self, buffer), name = "bybit::backfill")]
    pub async fn backfill(
        &self,
        buffer: &CandleBuffer,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<usize> {
        let mut candles = retry_with_backoff("kline backfill", RETRY_ATTEMPTS, RETRY_BASE_DELAY, move || {
            self.get_klines(symbol, interval, limit + 1)
        })
        .await?;

        // The newest bar is still open; the stream will deliver it.
        candles.pop();
        let count = candles.len();
        buffer.extend(&CandleKey::new(symbol, interval), candles);
        debug!(symbol, interval, count, "candle buffer backfilled");
        Ok(count)
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("base_url", &self.base_url)
            .field("category", &self.category)
            .field("limits", &self.limits)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Check `retCode` and return the `result` payload.
fn unwrap_result(path: &str, body: Value) -> Result<Value> {
    let code = body["retCode"].as_i64().unwrap_or(-1);
    if code != 0 {
        anyhow::bail!(
            "Bybit GET {} failed with retCode {}: {}",
            path,
            code,
            body["retMsg"].as_str().unwrap_or("<no message>")
        );
    }
    let mut body = body;
    Ok(body["result"].take())
}

/// Server time from a `/v5/market/time` body.
///
/// Prefers `result.timeNano`, falling back to the top-level `time` field.
pub fn parse_server_time(body: &Value) -> Result<i64> {
    if let Some(nanos) = body["result"]["timeNano"]
        .as_str()
        .and_then(|s| s.parse::<i128>().ok())
    {
        return Ok((nanos / 1_000_000) as i64);
    }
    body["time"]
        .as_i64()
        .context("server time response carries neither timeNano nor time")
}

/// Candles from a kline `result` object, oldest first.
pub fn parse_kline_list(result: &Value) -> Result<Vec<Candle>> {
    let list = result["list"]
        .as_array()
        .context("kline result missing 'list' array")?;

    let mut candles = Vec::with_capacity(list.len());
    for entry in list {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let start: i64 = match &arr[0] {
            Value::String(s) => s
                .parse()
                .with_context(|| format!("failed to parse startTime '{s}'"))?,
            other => other.as_i64().context("startTime is not an integer")?,
        };
        let mut candle = Candle::new(
            start,
            parse_string_f64(&arr[1], "open")?,
            parse_string_f64(&arr[2], "high")?,
            parse_string_f64(&arr[3], "low")?,
            parse_string_f64(&arr[4], "close")?,
            parse_string_f64(&arr[5], "volume")?,
        );
        if let Some(turnover) = arr.get(6) {
            candle.turnover = parse_string_f64(turnover, "turnover").unwrap_or(0.0);
        }
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kline_list_is_returned_oldest_first() {
        let result = json!({
            "category": "linear",
            "symbol": "BTCUSDT",
            "list": [
                ["1670608800000", "17071", "17073", "17027", "17055.5", "268611", "15.74"],
                ["1670605200000", "17071.5", "17071.5", "17061", "17071", "4177", "0.24"]
            ]
        });
        let candles = parse_kline_list(&result).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1_670_605_200_000);
        assert_eq!(candles[1].close, 17055.5);
        assert_eq!(candles[1].turnover, 15.74);
        assert!(candles.iter().all(|c| c.is_closed));
    }

    #[test]
    fn malformed_entries_are_skipped_and_bad_numbers_fail() {
        let result = json!({ "list": [["1", "2"]] });
        assert!(parse_kline_list(&result).unwrap().is_empty());

        let result = json!({ "list": [["1", "x", "1", "1", "1", "1"]] });
        assert!(parse_kline_list(&result).is_err());

        assert!(parse_kline_list(&json!({})).is_err());
    }

    #[test]
    fn server_time_prefers_nanos() {
        let body = json!({
            "retCode": 0,
            "result": { "timeSecond": "1688639403", "timeNano": "1688639403423213947" },
            "time": 1688639403999i64
        });
        assert_eq!(parse_server_time(&body).unwrap(), 1_688_639_403_423);

        let body = json!({ "retCode": 0, "result": {}, "time": 1688639403999i64 });
        assert_eq!(parse_server_time(&body).unwrap(), 1_688_639_403_999);

        assert!(parse_server_time(&json!({})).is_err());
    }

    #[test]
    fn non_zero_ret_code_is_an_error() {
        let err = unwrap_result(
            "/v5/market/kline",
            json!({ "retCode": 10001, "retMsg": "params error", "result": {} }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("params error"));

        let ok = unwrap_result("/x", json!({ "retCode": 0, "result": { "list": [] } })).unwrap();
        assert!(ok["list"].is_array());
    }

    #[test]
    fn client_trims_base_url() {
        let client = BybitClient::new("https://api-testnet.bybit.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://api-testnet.bybit.com");
        assert!(format!("{client:?}").contains("linear"));
    }
}
