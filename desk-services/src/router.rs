//! Exchange router
//!
//! Dispatches the data-source traits onto the concrete exchange clients and
//! normalizes candle intervals per exchange before dispatch.

use async_trait::async_trait;
use desk_binance::BinanceClient;
use desk_bybit::BybitClient;
use desk_core::{
    AccountDataSource, BalanceSnapshot, Candle, CandleInterval, DeskError, Exchange,
    ExchangeCredential, MarketDataSource, OrderBook, Ticker, Trade,
};

/// Intervals each provider serves natively
const BINANCE_INTERVALS: &[CandleInterval] = &[
    CandleInterval::OneMinute,
    CandleInterval::FiveMinutes,
    CandleInterval::FifteenMinutes,
    CandleInterval::ThirtyMinutes,
    CandleInterval::OneHour,
    CandleInterval::FourHours,
    CandleInterval::OneDay,
    CandleInterval::OneWeek,
];

const BYBIT_INTERVALS: &[CandleInterval] = &[
    CandleInterval::OneMinute,
    CandleInterval::FiveMinutes,
    CandleInterval::FifteenMinutes,
    CandleInterval::ThirtyMinutes,
    CandleInterval::OneHour,
    CandleInterval::FourHours,
    CandleInterval::OneDay,
    CandleInterval::OneWeek,
];

/// Map an interval onto the closest one a provider actually serves
///
/// Ties resolve toward the shorter interval so derived statistics never
/// span a longer window than requested.
pub fn nearest_supported(
    interval: CandleInterval,
    supported: &[CandleInterval],
) -> CandleInterval {
    if supported.contains(&interval) {
        return interval;
    }
    supported
        .iter()
        .copied()
        .min_by_key(|candidate| {
            (
                candidate.to_seconds().abs_diff(interval.to_seconds()),
                candidate.to_seconds(),
            )
        })
        .unwrap_or(interval)
}

/// Routes desk-wide queries to the right exchange client
#[derive(Debug, Clone)]
pub struct ExchangeRouter {
    binance: BinanceClient,
    bybit: BybitClient,
}

impl ExchangeRouter {
    pub fn new(binance: BinanceClient, bybit: BybitClient) -> Self {
        Self { binance, bybit }
    }

    pub fn binance(&self) -> &BinanceClient {
        &self.binance
    }

    pub fn bybit(&self) -> &BybitClient {
        &self.bybit
    }

    /// Normalize an interval for one exchange before dispatch
    pub fn normalize_interval(exchange: Exchange, interval: CandleInterval) -> CandleInterval {
        match exchange {
            Exchange::Binance => nearest_supported(interval, BINANCE_INTERVALS),
            Exchange::Bybit => nearest_supported(interval, BYBIT_INTERVALS),
        }
    }
}

#[async_trait]
impl MarketDataSource for ExchangeRouter {
    async fn ticker(&self, exchange: Exchange, symbol: &str) -> Result<Ticker, DeskError> {
        match exchange {
            Exchange::Binance => self.binance.ticker_24h(symbol).await,
            Exchange::Bybit => self.bybit.ticker_24h(symbol).await,
        }
    }

    async fn candles(
        &self,
        exchange: Exchange,
        symbol: &str,
        interval: CandleInterval,
        limit: u32,
    ) -> Result<Vec<Candle>, DeskError> {
        let interval = Self::normalize_interval(exchange, interval);
        match exchange {
            Exchange::Binance => self.binance.klines(symbol, interval, limit).await,
            Exchange::Bybit => self.bybit.klines(symbol, interval, limit).await,
        }
    }

    async fn order_book(
        &self,
        exchange: Exchange,
        symbol: &str,
        depth: u32,
    ) -> Result<OrderBook, DeskError> {
        match exchange {
            Exchange::Binance => self.binance.depth(symbol, depth).await,
            Exchange::Bybit => self.bybit.order_book(symbol, depth).await,
        }
    }

    async fn recent_trades(
        &self,
        exchange: Exchange,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Trade>, DeskError> {
        match exchange {
            Exchange::Binance => self.binance.recent_trades(symbol, limit).await,
            Exchange::Bybit => self.bybit.recent_trades(symbol, limit).await,
        }
    }
}

#[async_trait]
impl AccountDataSource for ExchangeRouter {
    async fn balance_snapshot(
        &self,
        exchange: Exchange,
        credential: &ExchangeCredential,
    ) -> Result<BalanceSnapshot, DeskError> {
        match exchange {
            Exchange::Binance => self.binance.account_snapshot(credential).await,
            Exchange::Bybit => self.bybit.wallet_balance(credential).await,
        }
    }
}
