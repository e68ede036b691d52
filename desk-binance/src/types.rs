//! Binance API response types
//!
//! Every provider payload is decoded into one of these schemas before any
//! desk logic consumes it.

use chrono::{DateTime, Utc};
use desk_core::{
    AssetBalance, BalanceSnapshot, Candle, Exchange, OrderBook, OrderBookLevel, Ticker, Trade,
    TradeSide,
};
use rust_decimal::Decimal;
use serde::Deserialize;

fn timestamp_ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// `GET /api/v3/time`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    pub server_time: i64,
}

/// Error body returned alongside non-2xx statuses
///
/// Well-known codes: `-1021` timestamp outside recvWindow, `-1003` too many
/// requests, `-2014` bad API-key format, `-2015` invalid key/IP/permissions.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// `GET /api/v3/ticker/24hr`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hResponse {
    pub symbol: String,
    pub last_price: Decimal,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Ticker24hResponse {
    pub fn to_ticker(self) -> Ticker {
        Ticker {
            exchange: Exchange::Binance,
            symbol: self.symbol,
            last_price: self.last_price,
            price_change: Some(self.price_change),
            price_change_percent: Some(self.price_change_percent),
            high: Some(self.high_price),
            low: Some(self.low_price),
            volume: Some(self.volume),
            timestamp: timestamp_ms_to_datetime(self.close_time),
        }
    }
}

/// One kline row from `GET /api/v3/klines`
///
/// The provider returns heterogeneous JSON arrays:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
///   trades, takerBase, takerQuote, unused]`
#[derive(Debug, Clone, Deserialize)]
pub struct KlineRow(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub i64,
    pub Decimal,
    pub i64,
    pub Decimal,
    pub Decimal,
    pub serde_json::Value,
);

impl KlineRow {
    pub fn to_candle(&self) -> Candle {
        Candle {
            open_time: timestamp_ms_to_datetime(self.0),
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
        }
    }
}

/// `GET /api/v3/depth`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthResponse {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl DepthResponse {
    pub fn to_order_book(self, symbol: &str) -> OrderBook {
        let mut book = OrderBook::new(Exchange::Binance, symbol);
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
        book.timestamp = Utc::now();
        book
    }
}

/// One entry from `GET /api/v3/trades`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTradeResponse {
    pub id: i64,
    pub price: Decimal,
    pub qty: Decimal,
    pub time: i64,
    pub is_buyer_maker: bool,
}

impl RecentTradeResponse {
    pub fn to_trade(self, symbol: &str) -> Trade {
        Trade {
            id: self.id.to_string(),
            exchange: Exchange::Binance,
            symbol: symbol.to_string(),
            price: self.price,
            quantity: self.qty,
            // buyer-maker means the taker sold into the bid
            side: Some(if self.is_buyer_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            }),
            timestamp: timestamp_ms_to_datetime(self.time),
        }
    }
}

/// Balance entry inside `GET /api/v3/account`
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalanceEntry {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// `GET /api/v3/account`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub balances: Vec<AccountBalanceEntry>,
    #[serde(default)]
    pub update_time: i64,
}

impl AccountResponse {
    /// Convert to a snapshot, dropping zero balances the way the UI expects
    pub fn to_balance_snapshot(self) -> BalanceSnapshot {
        let balances = self
            .balances
            .into_iter()
            .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
            .map(|b| AssetBalance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect();

        BalanceSnapshot {
            exchange: Exchange::Binance,
            balances,
            timestamp: if self.update_time > 0 {
                timestamp_ms_to_datetime(self.update_time)
            } else {
                Utc::now()
            },
        }
    }
}

/// `POST /api/v3/userDataStream`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    pub listen_key: String,
}
