//! Typed user-stream protocol
//!
//! The streaming session manager publishes decoded stream events as typed
//! notifications, decoupled from the socket transport so the session logic
//! can be tested without a live connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::credentials::ExchangeCredential;
use crate::error::DeskError;
use crate::market::{AssetBalance, TradeSide};

/// Lifecycle state of a user stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// Provider throttled token acquisition; resumption is scheduled
    RateLimited,
    Disconnected,
    /// Reconnect attempts exhausted; the session was abandoned
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::RateLimited => "rate_limited",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Account balance change pushed over the user stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub balances: Vec<AssetBalance>,
    pub event_time: DateTime<Utc>,
}

/// Order state change pushed over the user stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    /// Provider order status, e.g. "NEW", "FILLED", "CANCELED"
    pub status: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub event_time: DateTime<Utc>,
}

/// Decoded data payload arriving over a user-stream transport
#[derive(Debug, Clone)]
pub enum StreamPayload {
    Balance(BalanceUpdate),
    Order(OrderUpdate),
}

/// Event published by the session manager, tagged with its owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    BalanceUpdate(BalanceUpdate),
    OrderUpdate(OrderUpdate),
    ConnectionStatus {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        message: String,
    },
}

/// A stream event with the user it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamNotification {
    pub user_id: String,
    pub event: StreamEvent,
}

// ============================================================================
// Transport collaborators
// ============================================================================

/// Frame delivered by a stream transport to the session manager
#[derive(Debug)]
pub enum TransportFrame {
    /// A decoded data payload
    Payload(StreamPayload),
    /// The underlying connection closed
    Closed { reason: Option<String> },
}

/// A live transport connection
///
/// Dropping `close` (or sending on it) asks the transport task to shut the
/// socket down; the frame channel ends when the connection is gone.
pub struct StreamConnection {
    pub frames: mpsc::Receiver<TransportFrame>,
    pub close: oneshot::Sender<()>,
}

/// Stream-token lifecycle operations (create / renew / release)
#[async_trait]
pub trait StreamTokenApi: Send + Sync {
    async fn create_stream_token(
        &self,
        credential: &ExchangeCredential,
    ) -> Result<String, DeskError>;

    async fn renew_stream_token(
        &self,
        credential: &ExchangeCredential,
        token: &str,
    ) -> Result<(), DeskError>;

    async fn release_stream_token(
        &self,
        credential: &ExchangeCredential,
        token: &str,
    ) -> Result<(), DeskError>;
}

/// Opens persistent connections addressed by a live stream token
#[async_trait]
pub trait UserStreamTransport: Send + Sync {
    async fn open(&self, token: &str) -> Result<StreamConnection, DeskError>;
}
