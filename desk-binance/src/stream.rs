//! Binance user-data-stream transport
//!
//! Connects to the streaming endpoint addressed by a live listen key and
//! forwards decoded frames to the session manager. The socket task owns the
//! connection; the manager only sees the frame channel and a close signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use desk_core::{
    AssetBalance, BalanceUpdate, DeskError, DeskResult, OrderUpdate, StreamConnection,
    StreamPayload, TradeSide, TransportFrame, UserStreamTransport,
};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Binance user-data-stream base URL
const BINANCE_STREAM_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Frame channel depth between the socket task and the session manager
const FRAME_CHANNEL_CAPACITY: usize = 256;

fn timestamp_ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

// ============================================================================
// Stream message types (matching the provider's protocol)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct WsBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: Decimal,
    #[serde(rename = "l")]
    locked: Decimal,
}

/// `outboundAccountPosition` event
#[derive(Debug, Clone, Deserialize)]
struct AccountPositionMsg {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "B")]
    balances: Vec<WsBalance>,
}

impl AccountPositionMsg {
    fn to_balance_update(self) -> BalanceUpdate {
        BalanceUpdate {
            balances: self
                .balances
                .into_iter()
                .map(|b| AssetBalance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                })
                .collect(),
            event_time: timestamp_ms_to_datetime(self.event_time),
        }
    }
}

/// `executionReport` event
#[derive(Debug, Clone, Deserialize)]
struct ExecutionReportMsg {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "c")]
    client_order_id: Option<String>,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "z")]
    filled_quantity: Decimal,
}

impl ExecutionReportMsg {
    fn to_order_update(self) -> OrderUpdate {
        OrderUpdate {
            symbol: self.symbol,
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id.filter(|c| !c.is_empty()),
            side: match self.side.as_str() {
                "BUY" => Some(TradeSide::Buy),
                "SELL" => Some(TradeSide::Sell),
                _ => None,
            },
            status: self.status,
            price: self.price,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            event_time: timestamp_ms_to_datetime(self.event_time),
        }
    }
}

/// Decode one raw stream frame into a typed payload
///
/// Returns `Ok(None)` for event types the desk does not consume. A malformed
/// frame is an error for the caller to log and skip; it never tears down the
/// session.
pub fn decode_user_stream_event(text: &str) -> DeskResult<Option<StreamPayload>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| DeskError::parse(format!("Bad stream frame: {}", e)))?;

    match value.get("e").and_then(|v| v.as_str()) {
        Some("outboundAccountPosition") => {
            let msg: AccountPositionMsg = serde_json::from_value(value)
                .map_err(|e| DeskError::parse(format!("Bad account position event: {}", e)))?;
            Ok(Some(StreamPayload::Balance(msg.to_balance_update())))
        }
        Some("executionReport") => {
            let msg: ExecutionReportMsg = serde_json::from_value(value)
                .map_err(|e| DeskError::parse(format!("Bad execution report: {}", e)))?;
            Ok(Some(StreamPayload::Order(msg.to_order_update())))
        }
        _ => Ok(None),
    }
}

// ============================================================================
// Transport
// ============================================================================

/// User-data-stream transport for Binance
#[derive(Debug, Clone)]
pub struct BinanceUserStream {
    stream_base: String,
}

impl BinanceUserStream {
    pub fn new() -> Self {
        Self {
            stream_base: std::env::var("DESK_BINANCE_STREAM_URL")
                .unwrap_or_else(|_| BINANCE_STREAM_BASE.to_string()),
        }
    }

    pub fn with_stream_base(stream_base: impl Into<String>) -> Self {
        Self {
            stream_base: stream_base.into(),
        }
    }
}

impl Default for BinanceUserStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStreamTransport for BinanceUserStream {
    async fn open(&self, token: &str) -> DeskResult<StreamConnection> {
        let url = format!("{}/{}", self.stream_base, token);
        info!("[Binance WS] Connecting user stream");

        let (ws_stream, _) = connect_async(&url).await.map_err(|e| {
            DeskError::stream_disconnected(format!("User stream connect failed: {}", e))
        })?;

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(async move {
            run_socket(ws_stream, frame_tx, close_rx).await;
        });

        Ok(StreamConnection {
            frames: frame_rx,
            close: close_tx,
        })
    }
}

async fn run_socket(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    frame_tx: mpsc::Sender<TransportFrame>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            // The manager asked for (or dropped) the close handle.
            _ = &mut close_rx => {
                info!("[Binance WS] Close requested, shutting down user stream");
                let _ = write.send(Message::Close(None)).await;
                return;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_user_stream_event(&text) {
                            Ok(Some(payload)) => {
                                if frame_tx.send(TransportFrame::Payload(payload)).await.is_err() {
                                    // Receiver detached; nothing left to feed.
                                    return;
                                }
                            }
                            Ok(None) => {
                                debug!("[Binance WS] Ignoring stream event");
                            }
                            Err(e) => {
                                warn!("[Binance WS] Skipping malformed stream frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("[Binance WS] Failed to send pong: {}", e);
                            let _ = frame_tx
                                .send(TransportFrame::Closed { reason: Some(e.to_string()) })
                                .await;
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("[Binance WS] Connection closed by server");
                        let _ = frame_tx
                            .send(TransportFrame::Closed {
                                reason: frame.map(|f| f.reason.to_string()),
                            })
                            .await;
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("[Binance WS] Stream error: {}", e);
                        let _ = frame_tx
                            .send(TransportFrame::Closed { reason: Some(e.to_string()) })
                            .await;
                        return;
                    }
                    None => {
                        info!("[Binance WS] Stream ended");
                        let _ = frame_tx.send(TransportFrame::Closed { reason: None }).await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
