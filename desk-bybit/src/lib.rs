//! Bybit integration for the Crypto Trading Desk
//!
//! Signed REST client for the header-signature family: the HMAC travels only
//! in `X-BAPI-*` headers, never in the query string.

pub mod client;
pub mod types;

pub use client::{BybitClient, BybitClientConfig, SignedPayload};
