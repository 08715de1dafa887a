// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a trade or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for Buy, -1.0 for Sell. Multiplying a price delta by this gives
    /// the signed profit contribution.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// How an order enters the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or the paper broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Normalized broker return code. Every terminal-specific retcode is folded
/// into one of these four categories at the gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetCode {
    Ok,
    /// Worth retrying with backoff (requotes, network blips, busy terminal).
    Transient,
    /// Hard rejection with the broker's reason. Never auto-retried.
    Rejected(String),
    Timeout,
}

impl RetCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for RetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Rejected(reason) => write!(f, "REJECTED({reason})"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Strip the broker's symbol suffix so every internal reference uses one
/// canonical spelling. `suffix` comes from config (often empty).
pub fn normalize_symbol(raw: &str, suffix: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if suffix.is_empty() {
        return upper;
    }
    let suffix = suffix.to_uppercase();
    if let Some(stripped) = upper.strip_suffix(&suffix) {
        stripped.to_string()
    } else {
        upper
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn retcode_classification() {
        assert!(RetCode::Ok.is_ok());
        assert!(RetCode::Transient.is_transient());
        assert!(RetCode::Timeout.is_transient());
        assert!(!RetCode::Rejected("no money".into()).is_transient());
    }

    #[test]
    fn retcode_display() {
        assert_eq!(format!("{}", RetCode::Ok), "OK");
        assert_eq!(
            format!("{}", RetCode::Rejected("invalid stops".into())),
            "REJECTED(invalid stops)"
        );
    }

    #[test]
    fn normalize_strips_suffix() {
        assert_eq!(normalize_symbol("xauusd.m", ".m"), "XAUUSD");
        assert_eq!(normalize_symbol("EURUSD", ".m"), "EURUSD");
        assert_eq!(normalize_symbol(" btcusd ", ""), "BTCUSD");
    }
}
