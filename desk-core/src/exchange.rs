//! Exchange definitions for the trading desk

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported trading exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    /// Binance spot API
    Binance,
    /// Bybit v5 unified API
    Bybit,
}

impl Exchange {
    /// Get a short identifier for the exchange (for display)
    pub fn short_name(&self) -> &'static str {
        match self {
            Exchange::Binance => "BN",
            Exchange::Bybit => "BB",
        }
    }

    /// Get the full display name
    pub fn display_name(&self) -> &'static str {
        match self {
            Exchange::Binance => "Binance",
            Exchange::Bybit => "Bybit",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" | "bn" => Ok(Exchange::Binance),
            "bybit" | "bb" => Ok(Exchange::Bybit),
            _ => Err(format!("Unknown exchange: {}", s)),
        }
    }
}
