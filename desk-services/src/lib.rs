//! Connectivity and market-data services for the Crypto Trading Desk
//!
//! This crate provides the service layer on top of the exchange clients:
//! per-user stream session management, shared poll multiplexing, market
//! detail aggregation, and their supporting collaborators.

pub mod events;
pub mod market_detail;
pub mod metadata;
pub mod poll_multiplexer;
pub mod router;
pub mod stream_manager;
pub mod ttl_cache;

pub use events::EventBus;
pub use market_detail::{DetailOptions, MarketDetailAggregator, MarketDetailConfig};
pub use metadata::CoinGeckoClient;
pub use poll_multiplexer::{
    PollConfig, PollKey, PollSubscription, PollUpdate, SharedPollMultiplexer,
};
pub use router::{nearest_supported, ExchangeRouter};
pub use stream_manager::{StreamSessionConfig, UserStreamSessionManager};
pub use ttl_cache::TtlCache;
