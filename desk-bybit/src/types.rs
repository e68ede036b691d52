//! Bybit v5 API response types
//!
//! All endpoints wrap their payload in a `retCode` envelope; list payloads
//! arrive as arrays of strings.

use chrono::{DateTime, Utc};
use desk_core::{
    AssetBalance, BalanceSnapshot, Candle, Exchange, OrderBook, OrderBookLevel, Ticker, Trade,
    TradeSide,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

fn timestamp_ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Some numeric fields arrive as the empty string on accounts that never
/// used the feature.
fn decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    raw.parse().map_err(serde::de::Error::custom)
}

/// Response envelope shared by every v5 endpoint
///
/// Well-known codes: `10002` timestamp outside recv window, `10003`/`10004`
/// invalid key or signature, `10006` rate limited, `10010` unmatched request
/// IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitEnvelope<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
    #[serde(default)]
    pub time: i64,
}

/// `GET /v5/market/time` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResult {
    pub time_second: String,
    pub time_nano: String,
}

impl ServerTimeResult {
    pub fn to_epoch_ms(&self) -> Option<i64> {
        self.time_second.parse::<i64>().ok().map(|s| s * 1_000)
    }
}

/// `GET /v5/market/tickers` result
#[derive(Debug, Clone, Deserialize)]
pub struct TickersResult {
    pub category: String,
    pub list: Vec<TickerItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerItem {
    pub symbol: String,
    pub last_price: Decimal,
    pub prev_price_24h: Decimal,
    /// 24h change as a fraction, e.g. "0.0358" for +3.58%
    pub price_24h_pcnt: Decimal,
    pub high_price_24h: Decimal,
    pub low_price_24h: Decimal,
    pub volume_24h: Decimal,
}

impl TickerItem {
    pub fn to_ticker(self) -> Ticker {
        let change = self.last_price - self.prev_price_24h;
        Ticker {
            exchange: Exchange::Bybit,
            symbol: self.symbol,
            last_price: self.last_price,
            price_change: Some(change),
            price_change_percent: Some(self.price_24h_pcnt * Decimal::ONE_HUNDRED),
            high: Some(self.high_price_24h),
            low: Some(self.low_price_24h),
            volume: Some(self.volume_24h),
            timestamp: Utc::now(),
        }
    }
}

/// `GET /v5/market/kline` result
///
/// Rows are `[startTime, open, high, low, close, volume, turnover]`, newest
/// first.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineResult {
    pub symbol: String,
    pub category: String,
    pub list: Vec<KlineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineItem(
    pub String,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
);

impl KlineResult {
    /// Convert to candles in chronological order
    pub fn to_candles(self) -> Vec<Candle> {
        let mut candles: Vec<Candle> = self
            .list
            .into_iter()
            .filter_map(|row| {
                let start_ms = row.0.parse::<i64>().ok()?;
                Some(Candle {
                    open_time: timestamp_ms_to_datetime(start_ms),
                    open: row.1,
                    high: row.2,
                    low: row.3,
                    close: row.4,
                    volume: row.5,
                })
            })
            .collect();
        candles.reverse();
        candles
    }
}

/// `GET /v5/market/orderbook` result
#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookResult {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    pub asks: Vec<(Decimal, Decimal)>,
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

impl OrderbookResult {
    pub fn to_order_book(self) -> OrderBook {
        let mut book = OrderBook::new(Exchange::Bybit, self.symbol);
        book.bids = self
            .bids
            .into_iter()
            .map(|(price, quantity)| OrderBookLevel::new(price, quantity))
            .collect();
        book.asks = self
            .asks
            .into_iter()
            .map(|(price, quantity)| OrderBookLevel::new(price, quantity))
            .collect();
        book.timestamp = timestamp_ms_to_datetime(self.timestamp_ms);
        book
    }
}

/// `GET /v5/market/recent-trade` result
#[derive(Debug, Clone, Deserialize)]
pub struct RecentTradesResult {
    pub category: String,
    pub list: Vec<RecentTradeItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTradeItem {
    pub exec_id: String,
    pub symbol: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: String,
    pub time: String,
}

impl RecentTradeItem {
    pub fn to_trade(self) -> Trade {
        let timestamp = self
            .time
            .parse::<i64>()
            .map(timestamp_ms_to_datetime)
            .unwrap_or_else(|_| Utc::now());
        Trade {
            id: self.exec_id,
            exchange: Exchange::Bybit,
            symbol: self.symbol,
            price: self.price,
            quantity: self.size,
            side: match self.side.as_str() {
                "Buy" => Some(TradeSide::Buy),
                "Sell" => Some(TradeSide::Sell),
                _ => None,
            },
            timestamp,
        }
    }
}

/// `GET /v5/account/wallet-balance` result
#[derive(Debug, Clone, Deserialize)]
pub struct WalletBalanceResult {
    pub list: Vec<WalletAccount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    pub account_type: String,
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCoin {
    pub coin: String,
    pub wallet_balance: Decimal,
    #[serde(default, deserialize_with = "decimal_or_zero")]
    pub locked: Decimal,
}

impl WalletBalanceResult {
    pub fn to_balance_snapshot(self) -> BalanceSnapshot {
        let balances = self
            .list
            .into_iter()
            .flat_map(|account| account.coin)
            .filter(|c| !c.wallet_balance.is_zero() || !c.locked.is_zero())
            .map(|c| AssetBalance {
                asset: c.coin,
                free: c.wallet_balance - c.locked,
                locked: c.locked,
            })
            .collect();

        BalanceSnapshot {
            exchange: Exchange::Bybit,
            balances,
            timestamp: Utc::now(),
        }
    }
}
