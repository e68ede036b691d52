//! Descriptive asset metadata from CoinGecko
//!
//! Free API, no authentication required. Queried by trading symbol; the
//! quote currency is stripped before the lookup.

use async_trait::async_trait;
use desk_core::{AssetMetadata, DeskError, DeskResult, MetadataProvider};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// Quote currencies stripped off trading symbols before lookup
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "BUSD", "USD", "EUR", "BTC", "ETH"];

/// CoinGecko metadata client
pub struct CoinGeckoClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    coins: Vec<SearchCoin>,
}

#[derive(Debug, Deserialize)]
struct SearchCoin {
    id: String,
    name: String,
    symbol: String,
    #[serde(default)]
    market_cap_rank: Option<u32>,
    #[serde(default)]
    large: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoinDetailResponse {
    #[serde(default)]
    description: Option<CoinDescription>,
    #[serde(default)]
    links: Option<CoinLinks>,
}

#[derive(Debug, Deserialize)]
struct CoinDescription {
    #[serde(default)]
    en: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoinLinks {
    #[serde(default)]
    homepage: Vec<String>,
}

impl CoinGeckoClient {
    pub fn new() -> Self {
        Self::with_base_url(COINGECKO_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("crypto-trading-desk/1.0")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Strip a known quote currency off a trading symbol
    pub fn base_asset(symbol: &str) -> &str {
        let upper_len = symbol.len();
        for quote in QUOTE_SUFFIXES {
            if upper_len > quote.len() && symbol.to_uppercase().ends_with(quote) {
                return &symbol[..upper_len - quote.len()];
            }
        }
        symbol
    }

    async fn search(&self, query: &str) -> DeskResult<SearchResponse> {
        let url = format!("{}/search?query={}", self.base_url, query);
        debug!("[CoinGecko] Searching: {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DeskError::network(format!("Metadata search failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeskError::protocol(
                i64::from(response.status().as_u16()),
                "Metadata search rejected".to_string(),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| DeskError::parse(format!("Failed to parse search response: {}", e)))
    }

    async fn coin_detail(&self, id: &str) -> DeskResult<CoinDetailResponse> {
        let url = format!(
            "{}/coins/{}?localization=false&tickers=false&market_data=false",
            self.base_url, id
        );
        debug!("[CoinGecko] Fetching detail: {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DeskError::network(format!("Metadata detail failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeskError::protocol(
                i64::from(response.status().as_u16()),
                format!("Metadata detail rejected for {}", id),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| DeskError::parse(format!("Failed to parse coin detail: {}", e)))
    }
}

impl Default for CoinGeckoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataProvider for CoinGeckoClient {
    async fn asset_metadata(&self, symbol: &str) -> Result<AssetMetadata, DeskError> {
        let base = Self::base_asset(symbol).to_uppercase();
        let search = self.search(&base).await?;

        let coin = search
            .coins
            .into_iter()
            .find(|c| c.symbol.eq_ignore_ascii_case(&base))
            .ok_or_else(|| DeskError::not_found(format!("No metadata for asset {}", base)))?;

        // Detail enriches the result; its failure only costs the optional
        // fields.
        let detail = match self.coin_detail(&coin.id).await {
            Ok(detail) => Some(detail),
            Err(e) => {
                warn!("[CoinGecko] Detail lookup for {} failed: {}", coin.id, e);
                None
            }
        };

        let description = detail
            .as_ref()
            .and_then(|d| d.description.as_ref())
            .and_then(|d| d.en.clone())
            .filter(|text| !text.is_empty());
        let website = detail
            .as_ref()
            .and_then(|d| d.links.as_ref())
            .and_then(|l| l.homepage.iter().find(|url| !url.is_empty()).cloned());

        Ok(AssetMetadata {
            symbol: base,
            name: coin.name,
            description,
            website,
            rank: coin.market_cap_rank,
            logo_url: coin.large,
        })
    }
}

impl std::fmt::Debug for CoinGeckoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinGeckoClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_asset_strips_quote_suffixes() {
        assert_eq!(CoinGeckoClient::base_asset("BTCUSDT"), "BTC");
        assert_eq!(CoinGeckoClient::base_asset("ETHBTC"), "ETH");
        assert_eq!(CoinGeckoClient::base_asset("SOLUSDC"), "SOL");
        // Bare asset passes through
        assert_eq!(CoinGeckoClient::base_asset("BTC"), "BTC");
        // Never strips down to nothing
        assert_eq!(CoinGeckoClient::base_asset("USDT"), "USDT");
    }

    #[test]
    fn parses_search_response() {
        let raw = r#"{
            "coins": [
                {"id": "bitcoin", "name": "Bitcoin", "symbol": "BTC", "market_cap_rank": 1,
                 "large": "https://example.com/btc.png"},
                {"id": "bitcoin-cash", "name": "Bitcoin Cash", "symbol": "BCH", "market_cap_rank": 20}
            ]
        }"#;
        let response: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.coins.len(), 2);
        assert_eq!(response.coins[0].id, "bitcoin");
        assert_eq!(response.coins[0].market_cap_rank, Some(1));
        assert!(response.coins[1].large.is_none());
    }

    #[test]
    fn parses_coin_detail() {
        let raw = r#"{
            "description": {"en": "Digital gold."},
            "links": {"homepage": ["", "https://bitcoin.org"]}
        }"#;
        let detail: CoinDetailResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            detail.description.and_then(|d| d.en).as_deref(),
            Some("Digital gold.")
        );
        assert_eq!(
            detail
                .links
                .and_then(|l| l.homepage.into_iter().find(|u| !u.is_empty())),
            Some("https://bitcoin.org".to_string())
        );
    }
}
