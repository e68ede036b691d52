//! Binance integration for the Crypto Trading Desk
//!
//! Signed REST client (query-string signature family), listen-key lifecycle,
//! and the user-data-stream WebSocket transport.

pub mod client;
pub mod stream;
pub mod types;

pub use client::{BinanceClient, BinanceClientConfig};
pub use stream::{decode_user_stream_event, BinanceUserStream};
