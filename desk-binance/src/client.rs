//! Binance REST client
//!
//! Signing follows the query-string family: parameters are serialized in
//! insertion order, `timestamp` and `recvWindow` are appended, and a trailing
//! `signature=<hmac-sha256-hex>` completes the query. The API key travels in
//! the `X-MBX-APIKEY` header.

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
    AccountResponse, ApiErrorBody, DepthResponse, KlineRow, ListenKeyResponse,
    RecentTradeResponse, ServerTimeResponse, Ticker24hResponse,
};

type HmacSha256 = Hmac<Sha256>;

/// Base URL for the Binance spot API
const BINANCE_API_BASE: &str = "https://api.binance.com";

/// Tolerance window for signed request timestamps, generous enough to absorb
/// ordinary clock drift
const DEFAULT_RECV_WINDOW_MS: u64 = 30_000;

/// Attempt budget shared by every failure class, 429 included
const MAX_REQUEST_ATTEMPTS: u32 = 3;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Wait applied to a 429 without a provider-supplied Retry-After
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(2);

/// Configuration for [`BinanceClient`]
#[derive(Debug, Clone)]
pub struct BinanceClientConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub rate_limit_wait: Duration,
    pub request_timeout: Duration,
}

impl Default for BinanceClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("DESK_BINANCE_API_URL")
                .unwrap_or_else(|_| BINANCE_API_BASE.to_string()),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            max_attempts: MAX_REQUEST_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Binance API client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    config: BinanceClientConfig,
    /// Difference between provider server time and local time, in ms
    server_time_offset_ms: Arc<AtomicI64>,
}

impl BinanceClient {
    /// Create a client with the default configuration
    pub fn new() -> Self {
        Self::with_config(BinanceClientConfig::default())
    }

    pub fn with_config(config: BinanceClientConfig) -> Self {
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

    /// Local time adjusted by the freshest known server-time offset
    fn adjusted_timestamp_ms(&self) -> i64 {
        Self::local_now_ms() + self.server_time_offset_ms.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Clock sync
    // ========================================================================

    /// Resync the server-time offset from the public time endpoint
    ///
    /// On failure the offset is reset to zero so signed requests fall back to
    /// the local clock.
    pub async fn sync_clock(&self) -> DeskResult<i64> {
        match self.public_get::<ServerTimeResponse>("/api/v3/time", &[]).await {
            Ok(time) => {
                let offset = time.server_time - Self::local_now_ms();
                self.server_time_offset_ms.store(offset, Ordering::SeqCst);
                debug!("[Binance] Clock synced, offset {}ms", offset);
                Ok(offset)
            }
            Err(e) => {
                warn!("[Binance] Clock sync failed, falling back to local time: {}", e);
                self.server_time_offset_ms.store(0, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Get the provider's server time
    pub async fn server_time(&self) -> DeskResult<DateTime<Utc>> {
        let time = self
            .public_get::<ServerTimeResponse>("/api/v3/time", &[])
            .await?;
        DateTime::from_timestamp_millis(time.server_time)
            .ok_or_else(|| DeskError::parse(format!("Bad server time: {}", time.server_time)))
    }

    // ========================================================================
    // Public market data
    // ========================================================================

    /// Get the 24h rolling ticker for a symbol
    #[instrument(skip(self))]
    pub async fn ticker_24h(&self, symbol: &str) -> DeskResult<Ticker> {
        let params = [("symbol", symbol.to_string())];
        let response: Ticker24hResponse = self.public_get("/api/v3/ticker/24hr", &params).await?;
        Ok(response.to_ticker())
    }

    /// Get candle history for a symbol, oldest first
    #[instrument(skip(self))]
    pub async fn klines(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: u32,
    ) -> DeskResult<Vec<Candle>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<KlineRow> = self.public_get("/api/v3/klines", &params).await?;
        Ok(rows.iter().map(KlineRow::to_candle).collect())
    }

    /// Get an order book snapshot for a symbol
    #[instrument(skip(self))]
    pub async fn depth(&self, symbol: &str, limit: u32) -> DeskResult<OrderBook> {
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let response: DepthResponse = self.public_get("/api/v3/depth", &params).await?;
        Ok(response.to_order_book(symbol))
    }

    /// Get recent public trades for a symbol
    #[instrument(skip(self))]
    pub async fn recent_trades(&self, symbol: &str, limit: u32) -> DeskResult<Vec<Trade>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let trades: Vec<RecentTradeResponse> = self.public_get("/api/v3/trades", &params).await?;
        Ok(trades.into_iter().map(|t| t.to_trade(symbol)).collect())
    }

    // ========================================================================
    // Signed requests
    // ========================================================================

    /// Execute a signed request against the given endpoint
    ///
    /// Retries up to the attempt budget: 429 waits for the provider-supplied
    /// Retry-After (or a default), a timestamp-drift rejection resyncs the
    /// clock and retries exactly once per call, and any other retryable
    /// failure backs off exponentially. Credential and whitelist failures are
    /// surfaced immediately.
    #[instrument(skip(self, params, credential))]
    pub async fn signed_request(
        &self,
        endpoint: &str,
        method: Method,
        params: &[(&str, String)],
        credential: &ExchangeCredential,
    ) -> DeskResult<Value> {
        self.execute_with_retry(|| {
            let query = self.signed_query(params, credential)?;
            let url = format!("{}{}?{}", self.config.base_url, endpoint, query);
            Ok(self
                .client
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &credential.api_key))
        })
        .await
    }

    /// Get the account balance snapshot (signed)
    #[instrument(skip(self, credential))]
    pub async fn account_snapshot(
        &self,
        credential: &ExchangeCredential,
    ) -> DeskResult<BalanceSnapshot> {
        let value = self
            .signed_request("/api/v3/account", Method::GET, &[], credential)
            .await?;
        let account: AccountResponse = serde_json::from_value(value)
            .map_err(|e| DeskError::parse(format!("Failed to parse account response: {}", e)))?;
        Ok(account.to_balance_snapshot())
    }

    // ========================================================================
    // Stream token (listen key) lifecycle
    // ========================================================================

    /// Create a user-data-stream listen key
    ///
    /// Listen-key endpoints authenticate with the API key header alone; no
    /// signature is attached. The same retry policy applies.
    #[instrument(skip(self, credential))]
    pub async fn create_listen_key(&self, credential: &ExchangeCredential) -> DeskResult<String> {
        let value = self
            .execute_with_retry(|| {
                let url = format!("{}/api/v3/userDataStream", self.config.base_url);
                Ok(self
                    .client
                    .post(&url)
                    .header("X-MBX-APIKEY", &credential.api_key))
            })
            .await?;
        let response: ListenKeyResponse = serde_json::from_value(value)
            .map_err(|e| DeskError::parse(format!("Failed to parse listen key: {}", e)))?;
        Ok(response.listen_key)
    }

    /// Renew a listen key, extending its validity window
    #[instrument(skip(self, credential, listen_key))]
    pub async fn keepalive_listen_key(
        &self,
        credential: &ExchangeCredential,
        listen_key: &str,
    ) -> DeskResult<()> {
        self.execute_with_retry(|| {
            let url = format!(
                "{}/api/v3/userDataStream?listenKey={}",
                self.config.base_url, listen_key
            );
            Ok(self
                .client
                .put(&url)
                .header("X-MBX-APIKEY", &credential.api_key))
        })
        .await?;
        Ok(())
    }

    /// Close a listen key
    #[instrument(skip(self, credential, listen_key))]
    pub async fn close_listen_key(
        &self,
        credential: &ExchangeCredential,
        listen_key: &str,
    ) -> DeskResult<()> {
        self.execute_with_retry(|| {
            let url = format!(
                "{}/api/v3/userDataStream?listenKey={}",
                self.config.base_url, listen_key
            );
            Ok(self
                .client
                .delete(&url)
                .header("X-MBX-APIKEY", &credential.api_key))
        })
        .await?;
        Ok(())
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    /// Build the canonical signed query for the current instant
    fn signed_query(
        &self,
        params: &[(&str, String)],
        credential: &ExchangeCredential,
    ) -> DeskResult<String> {
        let mut query = canonical_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={}",
            self.adjusted_timestamp_ms(),
            self.config.recv_window_ms
        ));
        let signature = sign(&credential.api_secret, &query)?;
        query.push_str("&signature=");
        query.push_str(&signature);
        Ok(query)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> DeskResult<T> {
        let url = if params.is_empty() {
            format!("{}{}", self.config.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.config.base_url, endpoint, canonical_query(params))
        };

        debug!("[Binance] GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeskError::network(format!("Request to {} failed: {}", endpoint, e)))?;

        Self::decode_response(response).await
    }

    /// Retry loop shared by every authenticated request
    ///
    /// `build` is invoked once per attempt so timestamps and signatures are
    /// always fresh. The drift resync is tracked by an explicit flag in the
    /// loop, bounding it to a single extra round trip per call.
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
                Ok(response) => Self::decode_response::<Value>(response).await,
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
                        // A second drift rejection after a resync will not
                        // improve on retry.
                        return Err(err);
                    }
                    drift_resync_done = true;
                    warn!("[Binance] Timestamp drift rejected, resyncing clock and retrying once");
                    let _ = self.sync_clock().await;
                }
                DeskError::RateLimited { .. } => {
                    if attempt < self.config.max_attempts {
                        let wait = err.retry_after().unwrap_or(self.config.rate_limit_wait);
                        debug!("[Binance] Rate limited, retrying in {:?}", wait);
                        tokio::time::sleep(wait).await;
                    }
                }
                _ => {
                    if attempt < self.config.max_attempts {
                        let backoff = self.config.backoff_base * 2u32.pow(attempt - 1);
                        debug!(
                            "[Binance] Attempt {} failed ({}), backing off {:?}",
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

    async fn decode_response<T: DeserializeOwned>(response: Response) -> DeskResult<T> {
        let status = response.status();

        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(DeskError::rate_limited(retry_after));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(api_error) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(map_api_error(api_error.code, &api_error.msg));
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(DeskError::invalid_credentials(format!(
                    "Binance rejected request ({}): {}",
                    status, body
                )));
            }
            return Err(DeskError::protocol(
                i64::from(status.as_u16()),
                format!("Binance API error ({}): {}", status, body),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DeskError::network(format!("Failed to read response body: {}", e)))?;
        serde_json::from_str(&body)
            .map_err(|e| DeskError::parse(format!("Failed to parse response: {}", e)))
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The listen key is the stream token the session manager hands around.
#[async_trait::async_trait]
impl desk_core::StreamTokenApi for BinanceClient {
    async fn create_stream_token(
        &self,
        credential: &ExchangeCredential,
    ) -> DeskResult<String> {
        self.create_listen_key(credential).await
    }

    async fn renew_stream_token(
        &self,
        credential: &ExchangeCredential,
        token: &str,
    ) -> DeskResult<()> {
        self.keepalive_listen_key(credential, token).await
    }

    async fn release_stream_token(
        &self,
        credential: &ExchangeCredential,
        token: &str,
    ) -> DeskResult<()> {
        self.close_listen_key(credential, token).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.config.base_url)
            .field(
                "server_time_offset_ms",
                &self.server_time_offset_ms.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// Serialize parameters in insertion order as `k=v&k=v`
pub fn canonical_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256 over the canonical query, hex encoded
pub fn sign(secret: &str, payload: &str) -> DeskResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeskError::internal(format!("Failed to create HMAC: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a Binance error body onto the desk taxonomy
fn map_api_error(code: i64, msg: &str) -> DeskError {
    match code {
        -1021 => DeskError::timestamp_drift(msg.to_string()),
        -1003 => DeskError::rate_limited(None),
        -2014 | -1022 => DeskError::invalid_credentials(msg.to_string()),
        -2015 => DeskError::ip_not_whitelisted(format!(
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

    // Documented signature example from the provider's API reference.
    const DOC_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
    const DOC_QUERY: &str = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
    const DOC_SIGNATURE: &str = "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71";

    #[test]
    fn signature_matches_reference_vector() {
        assert_eq!(sign(DOC_SECRET, DOC_QUERY).unwrap(), DOC_SIGNATURE);
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign("secret", "symbol=BTCUSDT&timestamp=1700000000000&recvWindow=30000").unwrap();
        let b = sign("secret", "symbol=BTCUSDT&timestamp=1700000000000&recvWindow=30000").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a,
            "0aba160b81b9ce5dfc3ed3450c9c1dc833623a034f851cf249096007a9f7dded"
        );
    }

    #[test]
    fn canonical_query_preserves_insertion_order() {
        let params = [
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
            ("quantity", "1".to_string()),
        ];
        assert_eq!(canonical_query(&params), "symbol=BTCUSDT&side=BUY&quantity=1");
    }

    #[test]
    fn signed_query_appends_timestamp_window_and_signature() {
        let client = BinanceClient::new();
        let cred = ExchangeCredential::new("key", "secret");
        let params = [("symbol", "BTCUSDT".to_string())];
        let query = client.signed_query(&params, &cred).unwrap();

        assert!(query.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(query.contains("&recvWindow=30000&signature="));
        // hex-encoded HMAC-SHA256 is 64 chars
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        assert!(matches!(
            map_api_error(-1021, "Timestamp for this request is outside of the recvWindow."),
            DeskError::TimestampDrift(_)
        ));
        assert!(matches!(
            map_api_error(-1003, "Too many requests."),
            DeskError::RateLimited { .. }
        ));
        assert!(matches!(
            map_api_error(-2014, "API-key format invalid."),
            DeskError::InvalidCredentials(_)
        ));
        assert!(matches!(
            map_api_error(-2015, "Invalid API-key, IP, or permissions for action."),
            DeskError::IpNotWhitelisted(_)
        ));
        assert!(matches!(
            map_api_error(-1102, "Mandatory parameter was not sent."),
            DeskError::Protocol { code: -1102, .. }
        ));
    }

    // ------------------------------------------------------------------
    // Retry behavior against a canned local server
    // ------------------------------------------------------------------

    /// Serve one canned response per accepted connection, then stop.
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
                    400 => "Bad Request",
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

    fn test_client(base_url: String) -> BinanceClient {
        BinanceClient::with_config(BinanceClientConfig {
            base_url,
            recv_window_ms: 5_000,
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
            rate_limit_wait: Duration::from_millis(5),
            request_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn drift_error_resyncs_and_retries_exactly_once() {
        let base = spawn_stub_server(vec![
            (
                400,
                r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#.into(),
            ),
            // served to the clock resync
            (200, r#"{"serverTime":1700000000000}"#.into()),
            (200, r#"{"ok":true}"#.into()),
        ])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("key", "secret");
        let value = client
            .signed_request("/api/v3/account", Method::GET, &[], &cred)
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn second_drift_error_is_not_retried() {
        let base = spawn_stub_server(vec![
            (400, r#"{"code":-1021,"msg":"drift"}"#.into()),
            (200, r#"{"serverTime":1700000000000}"#.into()),
            (400, r#"{"code":-1021,"msg":"drift"}"#.into()),
            // never reached: a second drift rejection is terminal
            (200, r#"{"ok":true}"#.into()),
        ])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("key", "secret");
        let result = client
            .signed_request("/api/v3/account", Method::GET, &[], &cred)
            .await;
        assert!(matches!(result, Err(DeskError::TimestampDrift(_))));
    }

    #[tokio::test]
    async fn rate_limit_waits_then_retries() {
        let base = spawn_stub_server(vec![
            (429, String::new()),
            (200, r#"{"listenKey":"abc123"}"#.into()),
        ])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("key", "secret");
        let key = client.create_listen_key(&cred).await.unwrap();
        assert_eq!(key, "abc123");
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_last_error() {
        let base = spawn_stub_server(vec![
            (429, String::new()),
            (429, String::new()),
            (429, String::new()),
        ])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("key", "secret");
        let result = client.create_listen_key(&cred).await;
        assert!(matches!(result, Err(DeskError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn invalid_credentials_are_never_retried() {
        let base = spawn_stub_server(vec![(
            400,
            r#"{"code":-2014,"msg":"API-key format invalid."}"#.into(),
        )])
        .await;

        let client = test_client(base);
        let cred = ExchangeCredential::new("bad", "creds");
        let result = client
            .signed_request("/api/v3/account", Method::GET, &[], &cred)
            .await;
        assert!(matches!(result, Err(DeskError::InvalidCredentials(_))));
    }
}
