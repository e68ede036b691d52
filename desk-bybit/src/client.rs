//! Bybit v5 REST client
//!
//! Signing follows the header family: the HMAC-SHA256 of
//! `timestamp + api_key + recv_window + payload` travels only in `X-BAPI-*`
//! headers. GET requests sign the alphabetically sorted query string, POST
//! requests sign the raw JSON body string.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use desk_core::{
    BalanceSnapshot, Candle, CandleInterval, DeskError, DeskResult, ExchangeCredential, OrderBook,
    Ticker, Trade,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::{
    BybitEnvelope, KlineResult, OrderbookResult, RecentTradesResult, ServerTimeResult,
    TickersResult, WalletBalanceResult,
};

type HmacSha256 = Hmac<Sha256>;

/// Base URL for the Bybit v5 API
const BYBIT_API_BASE: &str = "https://api.bybit.com";

/// Tolerance window for signed request timestamps
const DEFAULT_RECV_WINDOW_MS: u64 = 30_000;

const MAX_REQUEST_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(2);

/// Payload of a signed request
///
/// The variant decides the canonicalization rule: queries are sorted
/// alphabetically before signing, bodies are signed as the exact string that
/// is sent.
#[derive(Debug, Clone)]
pub enum SignedPayload<'a> {
    Query(&'a [(&'a str, String)]),
    Json(&'a Value),
}

/// Configuration for [`BybitClient`]
#[derive(Debug, Clone)]
pub struct BybitClientConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub rate_limit_wait: Duration,
    pub request_timeout: Duration,
}

impl Default for BybitClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("DESK_BYBIT_API_URL")
                .unwrap_or_else(|_| BYBIT_API_BASE.to_string()),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            max_attempts: MAX_REQUEST_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Bybit API client
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    config: BybitClientConfig,
    server_time_offset_ms: Arc<AtomicI64>,
}

impl BybitClient {
    pub fn new() -> Self {
        Self::with_config(BybitClientConfig::default())
    }

    pub fn with_config(config: BybitClientConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            config,
            server_time_offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn local_now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn adjusted_timestamp_ms(&self) -> i64 {
        Self::local_now_ms() + self.server_time_offset_ms.load(Ordering::SeqCst)
    }

    /// Map a desk interval onto the provider's kline identifiers
    fn interval_param(interval: CandleInterval) -> &'static str {
        match interval {
            CandleInterval::OneMinute => "1",
            CandleInterval::FiveMinutes => "5",
            CandleInterval::FifteenMinutes => "15",
            CandleInterval::ThirtyMinutes => "30",
            CandleInterval::OneHour => "60",
            CandleInterval::FourHours => "240",
            CandleInterval::OneDay => "D",
            CandleInterval::OneWeek => "W",
        }
    }

    // ========================================================================
    // Clock sync
    // ========================================================================

    /// Resync the server-time offset from the public time endpoint
    pub async fn sync_clock(&self) -> DeskResult<i64> {
        match self
            .public_get::<ServerTimeResult>("/v5/market/time", &[])
            .await
        {
            Ok(time) => {
                let server_ms = time.to_epoch_ms().ok_or_else(|| {
                    DeskError::parse(format!("Bad server time: {}", time.time_second))
                })?;
                let offset = server_ms - Self::local_now_ms();
                self.server_time_offset_ms.store(offset, Ordering::SeqCst);
                debug!("[Bybit] Clock synced, offset {}ms", offset);
                Ok(offset)
            }
            Err(e) => {
                warn!("[Bybit] Clock sync failed, falling back to local time: {}", e);
                self.server_time_offset_ms.store(0, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn server_time(&self) -> DeskResult<DateTime<Utc>> {
        let time = self
            .public_get::<ServerTimeResult>("/v5/market/time", &[])
            .await?;
        time.to_epoch_ms()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| DeskError::parse(format!("Bad server time: {}", time.time_second)))
    }

    // ========================================================================
    // Public market data
    // ========================================================================

    /// Get the 24h ticker for a spot symbol
    #[instrument(skip(self))]
    pub async fn ticker_24h(&self, symbol: &str) -> DeskResult<Ticker> {
        let params = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let result: TickersResult = self.public_get("/v5/market/tickers", &params).await?;
        result
            .list
            .into_iter()
            .next()
            .map(|item| item.to_ticker())
            .ok_or_else(|| DeskError::not_found(format!("No ticker for symbol {}", symbol)))
    }

    /// Get candle history for a spot symbol, oldest first
    #[instrument(skip(self))]
    pub async fn klines(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: u32,
    ) -> DeskResult<Vec<Candle>> {
        let params = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", Self::interval_param(interval).to_string()),
            ("limit", limit.to_string()),
        ];
        let result: KlineResult = self.public_get("/v5/market/kline", &params).await?;
        Ok(result.to_candles())
    }

    /// Get an order book snapshot for a spot symbol
    #[instrument(skip(self))]
    pub async fn order_book(&self, symbol: &str, limit: u32) -> DeskResult<OrderBook> {
        let params = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let result: OrderbookResult = self.public_get("/v5/market/orderbook", &params).await?;
        Ok(result.to_order_book())
    }

    /// Get recent public trades for a spot symbol
    #[instrument(skip(self))]
    pub async fn recent_trades(&self, symbol: &str, limit: u32) -> DeskResult<Vec<Trade>> {
        let params = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let result: RecentTradesResult =
            self.public_get("/v5/market/recent-trade", &params).await?;
        Ok(result.list.into_iter().map(|t| t.to_trade()).collect())
    }

    // ========================================================================
    // Signed requests
    // ========================================================================

    /// Execute a signed request against the given endpoint
    ///
    /// Same retry policy as the query-string family: a shared attempt budget
    /// covers 429 waits, one clock resync on timestamp drift, and exponential
    /// backoff for everything else retryable.
    #[instrument(skip(self, payload, credential))]
    pub async fn signed_request(
        &self,
        endpoint: &str,
        method: Method,
        payload: SignedPayload<'_>,
        credential: &ExchangeCredential,
    ) -> DeskResult<Value> {
        self.execute_with_retry(|| self.build_signed(endpoint, &method, &payload, credential))
            .await
    }

    /// Get the unified wallet balance snapshot (signed)
    #[instrument(skip(self, credential))]
    pub async fn wallet_balance(
        &self,
        credential: &ExchangeCredential,
    ) -> DeskResult<BalanceSnapshot> {
        let params = [("accountType", "UNIFIED".to_string())];
        let value = self
            .signed_request(
                "/v5/account/wallet-balance",
                Method::GET,
                SignedPayload::Query(&params),
                credential,
            )
            .await?;
        let result: WalletBalanceResult = serde_json::from_value(value)
            .map_err(|e| DeskError::parse(format!("Failed to parse wallet balance: {}", e)))?;
        Ok(result.to_balance_snapshot())
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    fn build_signed(
        &self,
        endpoint: &str,
        method: &Method,
        payload: &SignedPayload<'_>,
        credential: &ExchangeCredential,
    ) -> DeskResult<RequestBuilder> {
        let timestamp = self.adjusted_timestamp_ms().to_string();
        let recv_window = self.config.recv_window_ms.to_string();

        let (canonical, request) = match payload {
            SignedPayload::Query(params) => {
                let query = sorted_query(params);
                let url = if query.is_empty() {
                    format!("{}{}", self.config.base_url, endpoint)
                } else {
                    format!("{}{}?{}", self.config.base_url, endpoint, query)
                };
                (query, self.client.request(method.clone(), &url))
            }
            SignedPayload::Json(body) => {
                let body_str = body.to_string();
                let url = format!("{}{}", self.config.base_url, endpoint);
                let request = self
                    .client
                    .request(method.clone(), &url)
                    .header("Content-Type", "application/json")
                    .body(body_str.clone());
                (body_str, request)
            }
        };

        let signature = sign_request(
            &credential.api_secret,
            &timestamp,
            &credential.api_key,
            &recv_window,
            &canonical,
        )?;

        Ok(request
            .header("X-BAPI-API-KEY", &credential.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", recv_window)
            .header("X-BAPI-SIGN", signature))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> DeskResult<T> {
        let query = sorted_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.config.base_url, endpoint, query)
        };

        debug!("[Bybit] GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeskError::network(format!("Request to {} failed: {}", endpoint, e)))?;

        Self::decode_envelope(response).await
    }

    async fn execute_with_retry<F>(&self, build: F) -> DeskResult<Value>
    where
        F: Fn() -> DeskResult<RequestBuilder>,
    {
        let mut drift_resync_done = false;
        let mut last_error = DeskError::internal("request made no attempts");
        let mut attempt = 0u32;

        while attempt < self.config.max_attempts {
            let request = build()?;
            let outcome = match request.send().await {
                Ok(response) => Self::decode_envelope::<Value>(response).await,
                Err(e) => Err(DeskError::network(format!("Request failed: {}", e))),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            attempt += 1;
            match &err {
                DeskError::TimestampDrift(_) => {
                    if drift_resync_done {
                        return Err(err);
                    }
                    drift_resync_done = true;
                    warn!("[Bybit] Timestamp drift rejected, resyncing clock and retrying once");
                    let _ = self.sync_clock().await;
                }
                DeskError::RateLimited { .. } => {
                    if attempt < self.config.max_attempts {
                        let wait = err.retry_after().unwrap_or(self.config.rate_limit_wait);
                        debug!("[Bybit] Rate limited, retrying in {:?}", wait);
                        tokio::time::sleep(wait).await;
                    }
                }
                _ => {
                    if attempt < self.config.max_attempts {
                        let backoff = self.config.backoff_base * 2u32.pow(attempt - 1);
                        debug!(
                            "[Bybit] Attempt {} failed ({}), backing off {:?}",
                            attempt, err, backoff
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            last_error = err;
        }

        Err(last_error)
    }

    async fn decode_envelope<T: DeserializeOwned>(response: Response) -> DeskResult<T> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(DeskError::rate_limited(retry_after));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DeskError::network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(DeskError::protocol(
                i64::from(status.as_u16()),
                format!("Bybit API error ({}): {}", status, body),
            ));
        }

        let envelope: BybitEnvelope<T> = serde_json::from_str(&body)
            .map_err(|e| DeskError::parse(format!("Failed to parse response envelope: {}", e)))?;

        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, &envelope.ret_msg));
        }

        envelope
            .result
            .ok_or_else(|| DeskError::parse("Envelope missing result payload".to_string()))
    }
}

impl Default for BybitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("base_url", &self.config.base_url)
            .field(
                "server_time_offset_ms",
                &self.server_time_offset_ms.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// Serialize parameters sorted alphabetically by key as `k=v&k=v`
pub fn sorted_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex encoded
pub fn sign_request(
    secret: &str,
    timestamp: &str,
    api_key: &str,
    recv_window: &str,
    payload: &str,
) -> DeskResult<String> {
    let message = format!("{}{}{}{}", timestamp, api_key, recv_window, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeskError::internal(format!("Failed to create HMAC: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a Bybit retCode onto the desk taxonomy
fn map_ret_code(code: i64, msg: &str) -> DeskError {
    match code {
        10002 => DeskError::timestamp_drift(msg.to_string()),
        10003 | 10004 => DeskError::invalid_credentials(msg.to_string()),
        10006 => DeskError::rate_limited(None),
        10010 => DeskError::ip_not_whitelisted(format!(
            "{} (check the key's IP access restrictions)",
            msg
        )),
        _ => DeskError::protocol(code, msg.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn sorted_query_orders_alphabetically() {
        let params = [
            ("symbol", "BTCUSDT".to_string()),
            ("category", "spot".to_string()),
            ("limit", "50".to_string()),
        ];
        assert_eq!(sorted_query(&params), "category=spot&limit=50&symbol=BTCUSDT");
    }

    #[test]
    fn get_signature_matches_reference_vector() {
        let signature = sign_request(
            "desk-test-secret",
            "1700000000000",
            "desk-test-key",
            "30000",
            "category=spot&symbol=BTCUSDT",
        )
        .unwrap();
        assert_eq!(
            signature,
            "66c76e2e830ae626706290de1daff91b2ac46cb74ec89b3336fc25fb9e3e4e40"
        );
    }

    #[test]
    fn post_signature_matches_reference_vector() {
        let signature = sign_request(
            "desk-test-secret",
            "1700000000000",
            "desk-test-key",
            "30000",
            r#"{"category":"spot","symbol":"BTCUSDT"}"#,
        )
        .unwrap();
        assert_eq!(
            signature,
            "9a48cbe5f700abe5f37c88ea820dfe7c5ecd56cb37633e32e55c98704d2ab480"
        );
    }

    #[test]
    fn ret_codes_map_to_taxonomy() {
        assert!(matches!(
            map_ret_code(10002, "invalid request, please check your server timestamp"),
            DeskError::TimestampDrift(_)
        ));
        assert!(matches!(
            map_ret_code(10003, "API key is invalid"),
            DeskError::InvalidCredentials(_)
        ));
        assert!(matches!(
            map_ret_code(10004, "error sign"),
            DeskError::InvalidCredentials(_)
        ));
        assert!(matches!(
            map_ret_code(10006, "too many visits"),
            DeskError::RateLimited { .. }
        ));
        assert!(matches!(
            map_ret_code(10010, "unmatched IP"),
            DeskError::IpNotWhitelisted(_)
        ));
        assert!(matches!(
            map_ret_code(10001, "params error"),
            DeskError::Protocol { code: 10001, .. }
        ));
    }

    async fn spawn_stub_server(responses: Vec<(u16, String)>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let reason = match status {
                    200 => "OK",
                    429 => "Too Many Requests",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    fn test_client(base_url: String) -> BybitClient {
        BybitClient::with_config(BybitClientConfig {
            base_url,
            recv_window_ms: 5_000,
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
            rate_limit_wait: Duration::from_millis(5),
            request_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn envelope_rate_limit_is_retried() {
        let base = spawn_stub_server(vec![
            (
                200,
                r#"{"retCode":10006,"retMsg":"too many visits","result":{},"time":1}"#.into(),
            ),
            (
                200,
                r#"{"retCode":0,"retMsg":"OK","result":{"ok":true},"time":1}"#.into(),
            ),
        ])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("key", "secret");
        let params = [("accountType", "UNIFIED".to_string())];
        let value = client
            .signed_request(
                "/v5/account/wallet-balance",
                Method::GET,
                SignedPayload::Query(&params),
                &cred,
            )
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn invalid_key_ret_code_is_terminal() {
        let base = spawn_stub_server(vec![(
            200,
            r#"{"retCode":10003,"retMsg":"API key is invalid","result":{},"time":1}"#.into(),
        )])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("bad", "creds");
        let result = client.wallet_balance(&cred).await;
        assert!(matches!(result, Err(DeskError::InvalidCredentials(_))));
    }
}
