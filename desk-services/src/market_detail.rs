//! Market detail aggregator
//!
//! Composes one snapshot per (connection, symbol) from six independent
//! sources under settle-all semantics: every fetch runs to completion and a
//! failed source only costs its own field.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use desk_core::{
    AccountDataSource, Candle, CandleInterval, ConnectionDirectory, DeskResult, MarketDetail,
    MarketDataSource, MetadataProvider, Ticker,
};
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::router::ExchangeRouter;
use crate::ttl_cache::TtlCache;

/// Ticker/candle divergence above this many percent is logged
const DIVERGENCE_WARN_PERCENT: u32 = 5;

/// Configuration for [`MarketDetailAggregator`]
#[derive(Debug, Clone)]
pub struct MarketDetailConfig {
    /// Intervals fetched by default; the primary and daily intervals are
    /// always included for the derived statistics
    pub intervals: Vec<CandleInterval>,
    /// Interval whose trailing 24 candles back the 24h high/low/volume
    pub primary_interval: CandleInterval,
    pub candle_limit: u32,
    pub order_book_depth: u32,
    pub trade_limit: u32,
    /// TTL of the composed snapshot
    pub detail_ttl: Duration,
    /// TTL of each per-interval candle fetch, independent of the composed TTL
    pub candle_ttl: Duration,
}

impl Default for MarketDetailConfig {
    fn default() -> Self {
        Self {
            intervals: vec![CandleInterval::OneHour, CandleInterval::OneDay],
            primary_interval: CandleInterval::OneHour,
            candle_limit: 100,
            order_book_depth: 50,
            trade_limit: 50,
            detail_ttl: Duration::from_secs(30),
            candle_ttl: Duration::from_secs(60),
        }
    }
}

/// Per-call options for [`MarketDetailAggregator::market_detail`]
#[derive(Debug, Clone, Default)]
pub struct DetailOptions {
    /// Override the configured candle intervals
    pub intervals: Option<Vec<CandleInterval>>,
}

/// Aggregates ticker, candles, balances, metadata, order book, and trades
/// into one cached snapshot
pub struct MarketDetailAggregator {
    connections: Arc<dyn ConnectionDirectory>,
    market_data: Arc<dyn MarketDataSource>,
    accounts: Arc<dyn AccountDataSource>,
    metadata: Arc<dyn MetadataProvider>,
    detail_cache: TtlCache<MarketDetail>,
    candle_cache: TtlCache<Vec<Candle>>,
    config: MarketDetailConfig,
}

impl MarketDetailAggregator {
    pub fn new(
        connections: Arc<dyn ConnectionDirectory>,
        market_data: Arc<dyn MarketDataSource>,
        accounts: Arc<dyn AccountDataSource>,
        metadata: Arc<dyn MetadataProvider>,
        config: MarketDetailConfig,
    ) -> Self {
        Self {
            connections,
            market_data,
            accounts,
            metadata,
            detail_cache: TtlCache::new(),
            candle_cache: TtlCache::new(),
            config,
        }
    }

    /// Build (or serve from cache) the composed market detail snapshot
    ///
    /// An unresolvable connection is the only hard error; every data source
    /// degrades to `None`/empty on failure.
    #[instrument(skip(self, options))]
    pub async fn market_detail(
        &self,
        connection_id: &str,
        symbol: &str,
        options: DetailOptions,
    ) -> DeskResult<MarketDetail> {
        let profile = self.connections.resolve(connection_id).await?;
        let exchange = profile.exchange;

        let detail_key = format!("detail:{}:{}", connection_id, symbol);
        if let Some(mut detail) = self.detail_cache.get(&detail_key) {
            debug!("[Detail] Cache hit for {}", detail_key);
            detail.cached = true;
            return Ok(detail);
        }

        // The daily interval backs the price derivation and the primary
        // interval backs the 24h statistics, so both are always fetched.
        let mut requested = options
            .intervals
            .unwrap_or_else(|| self.config.intervals.clone());
        for required in [self.config.primary_interval, CandleInterval::OneDay] {
            if !requested.contains(&required) {
                requested.push(required);
            }
        }
        let mut intervals: Vec<CandleInterval> = Vec::new();
        for interval in requested {
            let normalized = ExchangeRouter::normalize_interval(exchange, interval);
            if !intervals.contains(&normalized) {
                intervals.push(normalized);
            }
        }

        let ticker_fut = self.market_data.ticker(exchange, symbol);
        let candles_fut = async {
            join_all(intervals.iter().map(|&interval| async move {
                let key = format!("candles:{}:{}:{}", exchange, symbol, interval);
                let result = self
                    .candle_cache
                    .get_or_set(&key, self.config.candle_ttl, || {
                        self.market_data
                            .candles(exchange, symbol, interval, self.config.candle_limit)
                    })
                    .await;
                (interval, result)
            }))
            .await
        };
        let balance_fut = self
            .accounts
            .balance_snapshot(exchange, &profile.credential);
        let metadata_fut = self.metadata.asset_metadata(symbol);
        let book_fut = self
            .market_data
            .order_book(exchange, symbol, self.config.order_book_depth);
        let trades_fut = self
            .market_data
            .recent_trades(exchange, symbol, self.config.trade_limit);

        let (ticker_res, candle_results, balance_res, metadata_res, book_res, trades_res) = tokio::join!(
            ticker_fut,
            candles_fut,
            balance_fut,
            metadata_fut,
            book_fut,
            trades_fut
        );

        let ticker = settle(ticker_res, "ticker", symbol);
        let balances = settle(balance_res, "balance", symbol);
        let metadata = settle(metadata_res, "metadata", symbol);
        let order_book = settle(book_res, "order book", symbol);
        let recent_trades = settle(trades_res, "recent trades", symbol).unwrap_or_default();

        let mut candles: HashMap<CandleInterval, Vec<Candle>> = HashMap::new();
        for (interval, result) in candle_results {
            match result {
                Ok(list) => {
                    candles.insert(interval, list);
                }
                Err(e) => {
                    warn!("[Detail] {} candle fetch for {} failed: {}", interval, symbol, e);
                    candles.insert(interval, Vec::new());
                }
            }
        }

        let daily = candles
            .get(&CandleInterval::OneDay)
            .map(|list| list.as_slice())
            .unwrap_or(&[]);
        let (price, change_24h, change_percent_24h, derived_from_candles) =
            derive_price(daily, ticker.as_ref());

        if derived_from_candles {
            if let Some(t) = &ticker {
                log_divergence(symbol, t, price);
            }
        }

        let primary = candles
            .get(&self.config.primary_interval)
            .map(|list| list.as_slice())
            .unwrap_or(&[]);
        let (mut high_24h, mut low_24h, mut volume_24h) = trailing_24_stats(primary);
        if let Some(t) = &ticker {
            high_24h = high_24h.or(t.high);
            low_24h = low_24h.or(t.low);
            volume_24h = volume_24h.or(t.volume);
        }

        let detail = MarketDetail {
            exchange,
            symbol: symbol.to_string(),
            price,
            change_24h,
            change_percent_24h,
            high_24h,
            low_24h,
            volume_24h,
            candles,
            order_book,
            recent_trades,
            balances,
            metadata,
            cached: false,
            generated_at: Utc::now(),
        };

        self.detail_cache
            .set(detail_key, detail.clone(), self.config.detail_ttl);
        Ok(detail)
    }
}

impl std::fmt::Debug for MarketDetailAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDetailAggregator")
            .field("config", &self.config)
            .finish()
    }
}

fn settle<T>(result: DeskResult<T>, source: &str, symbol: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[Detail] {} fetch for {} failed: {}", source, symbol, e);
            None
        }
    }
}

/// Prefer the two most recent daily closes over the live ticker
///
/// Ticker data can be stale or internally inconsistent; daily closes are
/// authoritative when at least two exist. Returns whether the price came
/// from candles.
fn derive_price(
    daily: &[Candle],
    ticker: Option<&Ticker>,
) -> (Decimal, Decimal, Decimal, bool) {
    if daily.len() >= 2 {
        let current = daily[daily.len() - 1].close;
        let previous = daily[daily.len() - 2].close;
        let change = current - previous;
        let percent = if previous.is_zero() {
            Decimal::ZERO
        } else {
            change / previous * Decimal::ONE_HUNDRED
        };
        return (current, change, percent, true);
    }

    match ticker {
        Some(t) => (
            t.last_price,
            t.price_change.unwrap_or_default(),
            t.price_change_percent.unwrap_or_default(),
            false,
        ),
        None => (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, false),
    }
}

/// High/low/volume over the trailing 24 candles of the primary interval
fn trailing_24_stats(candles: &[Candle]) -> (Option<Decimal>, Option<Decimal>, Option<Decimal>) {
    if candles.is_empty() {
        return (None, None, None);
    }
    let window = &candles[candles.len().saturating_sub(24)..];
    let high = window.iter().map(|c| c.high).max();
    let low = window.iter().map(|c| c.low).min();
    let volume = Some(window.iter().map(|c| c.volume).sum());
    (high, low, volume)
}

fn log_divergence(symbol: &str, ticker: &Ticker, derived: Decimal) {
    if derived.is_zero() {
        return;
    }
    let divergence = ((ticker.last_price - derived).abs() / derived) * Decimal::ONE_HUNDRED;
    if divergence > Decimal::from(DIVERGENCE_WARN_PERCENT) {
        warn!(
            "[Detail] Ticker price {} diverges {}% from candle-derived {} for {}",
            ticker.last_price, divergence, derived, symbol
        );
    }
}
