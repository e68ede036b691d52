//! Collaborator traits for market, account, and metadata data
//!
//! The service layer talks to exchanges and third parties through these
//! seams; production wiring dispatches to the concrete clients, tests plug
//! in counter-instrumented mocks.

use async_trait::async_trait;

use crate::credentials::ExchangeCredential;
use crate::error::DeskError;
use crate::exchange::Exchange;
use crate::market::{AssetMetadata, BalanceSnapshot, Candle, CandleInterval, OrderBook, Ticker, Trade};

/// Public market-data queries
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn ticker(&self, exchange: Exchange, symbol: &str) -> Result<Ticker, DeskError>;

    async fn candles(
        &self,
        exchange: Exchange,
        symbol: &str,
        interval: CandleInterval,
        limit: u32,
    ) -> Result<Vec<Candle>, DeskError>;

    async fn order_book(
        &self,
        exchange: Exchange,
        symbol: &str,
        depth: u32,
    ) -> Result<OrderBook, DeskError>;

    async fn recent_trades(
        &self,
        exchange: Exchange,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Trade>, DeskError>;
}

/// Signed account-data queries
#[async_trait]
pub trait AccountDataSource: Send + Sync {
    async fn balance_snapshot(
        &self,
        exchange: Exchange,
        credential: &ExchangeCredential,
    ) -> Result<BalanceSnapshot, DeskError>;
}

/// Third-party descriptive metadata, queried by symbol
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn asset_metadata(&self, symbol: &str) -> Result<AssetMetadata, DeskError>;
}

/// A logical exchange connection resolved from storage
///
/// The credential arrives already decrypted and is dropped with the profile
/// at the end of the call that resolved it.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub connection_id: String,
    pub user_id: String,
    pub exchange: Exchange,
    pub credential: ExchangeCredential,
}

/// Resolves connection ids to exchange + decrypted credentials
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn resolve(&self, connection_id: &str) -> Result<ConnectionProfile, DeskError>;
}

/// Returns the decrypted credential backing a user's stream session
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, user_id: &str) -> Result<ExchangeCredential, DeskError>;
}
