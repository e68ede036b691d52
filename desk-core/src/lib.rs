//! Core types for the Crypto Trading Desk
//!
//! This crate defines the shared data structures used across the desk,
//! including market data, stream notifications, credentials, and the
//! collaborator traits the service layer is built against.

pub mod credentials;
pub mod error;
pub mod exchange;
pub mod market;
pub mod source;
pub mod stream;

pub use credentials::ExchangeCredential;
pub use error::{DeskError, DeskResult};
pub use exchange::Exchange;
pub use market::{
    AssetBalance, AssetMetadata, BalanceSnapshot, Candle, CandleInterval, MarketDetail, OrderBook,
    OrderBookLevel, Ticker, Trade, TradeSide,
};
pub use source::{
    AccountDataSource, ConnectionDirectory, ConnectionProfile, CredentialProvider,
    MarketDataSource, MetadataProvider,
};
pub use stream::{
    BalanceUpdate, ConnectionState, OrderUpdate, StreamConnection, StreamEvent,
    StreamNotification, StreamPayload, StreamTokenApi, TransportFrame, UserStreamTransport,
};
