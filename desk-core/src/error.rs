//! Error types for the desk

use std::time::Duration;
use thiserror::Error;

/// Desk-wide error type
#[derive(Error, Debug)]
pub enum DeskError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid API credentials: {0}")]
    InvalidCredentials(String),

    #[error("request IP is not whitelisted for this API key: {0}")]
    IpNotWhitelisted(String),

    #[error("request timestamp outside the accepted window: {0}")]
    TimestampDrift(String),

    #[error("provider rejected request (code {code}): {message}")]
    Protocol { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeskError {
    pub fn network(msg: impl Into<String>) -> Self {
        DeskError::Network(msg.into())
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        DeskError::RateLimited { retry_after }
    }

    pub fn invalid_credentials(msg: impl Into<String>) -> Self {
        DeskError::InvalidCredentials(msg.into())
    }

    pub fn ip_not_whitelisted(msg: impl Into<String>) -> Self {
        DeskError::IpNotWhitelisted(msg.into())
    }

    pub fn timestamp_drift(msg: impl Into<String>) -> Self {
        DeskError::TimestampDrift(msg.into())
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        DeskError::Protocol {
            code,
            message: message.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        DeskError::Parse(msg.into())
    }

    pub fn stream_disconnected(msg: impl Into<String>) -> Self {
        DeskError::StreamDisconnected(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DeskError::NotFound(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        DeskError::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DeskError::Internal(msg.into())
    }

    /// Whether a failed request may be retried at all.
    ///
    /// Credential and whitelist failures are terminal; retrying them only
    /// burns the provider's error budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DeskError::InvalidCredentials(_) | DeskError::IpNotWhitelisted(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DeskError::RateLimited { .. })
    }

    /// Provider-supplied retry-after hint, when one exists.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeskError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for desk operations
pub type DeskResult<T> = Result<T, DeskError>;
