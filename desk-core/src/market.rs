//! Market data structures shared across exchanges

use crate::exchange::Exchange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Candle interval supported by the desk
///
/// Each exchange client normalizes these onto its own interval identifiers;
/// an interval a provider does not support maps to its nearest equivalent
/// before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl CandleInterval {
    /// Interval length in seconds
    pub fn to_seconds(&self) -> u64 {
        match self {
            CandleInterval::OneMinute => 60,
            CandleInterval::FiveMinutes => 300,
            CandleInterval::FifteenMinutes => 900,
            CandleInterval::ThirtyMinutes => 1_800,
            CandleInterval::OneHour => 3_600,
            CandleInterval::FourHours => 14_400,
            CandleInterval::OneDay => 86_400,
            CandleInterval::OneWeek => 604_800,
        }
    }

    /// Canonical string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::FifteenMinutes => "15m",
            CandleInterval::ThirtyMinutes => "30m",
            CandleInterval::OneHour => "1h",
            CandleInterval::FourHours => "4h",
            CandleInterval::OneDay => "1d",
            CandleInterval::OneWeek => "1w",
        }
    }

    /// Parse from the canonical string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" => Some(CandleInterval::OneMinute),
            "5m" => Some(CandleInterval::FiveMinutes),
            "15m" => Some(CandleInterval::FifteenMinutes),
            "30m" => Some(CandleInterval::ThirtyMinutes),
            "1h" => Some(CandleInterval::OneHour),
            "4h" => Some(CandleInterval::FourHours),
            "1d" => Some(CandleInterval::OneDay),
            "1w" => Some(CandleInterval::OneWeek),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 24h ticker snapshot for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: Exchange,
    pub symbol: String,

    /// Last traded price
    pub last_price: Decimal,

    /// Absolute price change over the trailing 24h, when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change: Option<Decimal>,

    /// Percentage price change over the trailing 24h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_percent: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    pub timestamp: DateTime<Utc>,
}

/// A single OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the candle bucket
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// A single price level in the order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub exchange: Exchange,
    pub symbol: String,
    /// Bids sorted by price descending
    pub bids: Vec<OrderBookLevel>,
    /// Asks sorted by price ascending
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }
}

/// Taker side of a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A public trade print
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    pub timestamp: DateTime<Utc>,
}

/// Balance of a single asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    /// Amount available for trading
    pub free: Decimal,
    /// Amount locked in open orders
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Account balance snapshot for one exchange connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub exchange: Exchange,
    pub balances: Vec<AssetBalance>,
    pub timestamp: DateTime<Utc>,
}

/// Descriptive metadata for a traded asset, from a third-party provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub symbol: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

/// Composed market detail snapshot
///
/// Built by the aggregator from six independent sources; any field backed by
/// a failed source is `None`/empty rather than failing the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDetail {
    pub exchange: Exchange,
    pub symbol: String,

    /// Current price, preferring daily-candle closes over the live ticker
    pub price: Decimal,
    pub change_24h: Decimal,
    pub change_percent_24h: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<Decimal>,

    /// Candle history keyed by interval
    pub candles: HashMap<CandleInterval, Vec<Candle>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_book: Option<OrderBook>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_trades: Vec<Trade>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub balances: Option<BalanceSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AssetMetadata>,

    /// Whether this snapshot was served from the composed-result cache
    pub cached: bool,

    pub generated_at: DateTime<Utc>,
}
