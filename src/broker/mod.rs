// =============================================================================
// Broker port — the terminal behind one narrow async interface
// =============================================================================
//
// Everything the engine knows about the broker terminal passes through
// `BrokerGateway`. Two implementations exist: the terminal-bridge client
// (live) and the paper broker (demo mode, dry runs, tests). All broker calls
// in the engine are serialized behind the order gateway adapter.
// =============================================================================

pub mod bridge;
pub mod gateway;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::market_data::{Candle, Tick, Timeframe};
use crate::types::{OrderKind, RetCode, Side};

/// Read-only mirror of a broker-owned position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
    pub opened_at_ms: i64,
    #[serde(default)]
    pub magic: u64,
}

impl Position {
    /// Unrealized profit as a fraction of the entry-to-TP distance.
    /// The exit manager's whole state machine is driven by this number.
    pub fn progress_to_tp(&self, current_price: f64) -> Option<f64> {
        let tp = self.tp?;
        let distance = (tp - self.entry_price).abs();
        if distance <= f64::EPSILON {
            return None;
        }
        Some(self.side.sign() * (current_price - self.entry_price) / distance)
    }

    /// Unrealized profit as a fraction of the entry-to-SL distance (the
    /// classic R multiple). Negative while losing.
    pub fn r_multiple(&self, current_price: f64, initial_sl: f64) -> Option<f64> {
        let risk = (self.entry_price - initial_sl).abs();
        if risk <= f64::EPSILON {
            return None;
        }
        Some(self.side.sign() * (current_price - self.entry_price) / risk)
    }
}

/// A resting order that has not filled yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub volume: f64,
}

/// A fully resolved order ready for the terminal.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    /// `None` for market orders — the terminal fills at the touch.
    pub entry: Option<f64>,
    pub sl: f64,
    pub tp: f64,
    pub volume: f64,
    /// Already truncated to the 31-byte terminal limit.
    pub comment: String,
    /// Time-in-force; always set, the terminal silently rejects otherwise.
    pub type_time: &'static str,
    pub magic: u64,
}

/// Terminal acknowledgement of an order action.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub ticket: u64,
    pub retcode: RetCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
}

/// Static symbol metadata from the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub digits: u32,
    /// Smallest price increment.
    pub point: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    /// Current spread in price units.
    pub spread: f64,
    /// Account-currency value of one point for one lot.
    pub tick_value: f64,
}

/// The opaque broker terminal.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Stream live ticks for the given symbols. The receiver closes when the
    /// broker connection is gone for good.
    async fn subscribe_ticks(&self, symbols: &[String]) -> Result<mpsc::Receiver<Tick>>;

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize)
        -> Result<Vec<Candle>>;

    async fn list_positions(&self) -> Result<Vec<Position>>;

    async fn list_pending_orders(&self) -> Result<Vec<PendingOrder>>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn modify_position(
        &self,
        ticket: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<RetCode>;

    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<f64>,
        comment: &str,
    ) -> Result<RetCode>;

    async fn cancel_order(&self, ticket: u64) -> Result<RetCode>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn current_quote(&self, symbol: &str) -> Result<Tick>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side) -> Position {
        Position {
            ticket: 1,
            symbol: "XAUUSD".into(),
            side,
            volume: 0.02,
            entry_price: 2450.0,
            sl: Some(2446.0),
            tp: Some(2458.0),
            opened_at_ms: 0,
            magic: 77,
        }
    }

    #[test]
    fn progress_to_tp_long() {
        let p = position(Side::Buy);
        // (2452 - 2450) / 8 = 0.25
        assert!((p.progress_to_tp(2452.0).unwrap() - 0.25).abs() < 1e-12);
        assert!(p.progress_to_tp(2448.0).unwrap() < 0.0);
    }

    #[test]
    fn progress_to_tp_short() {
        let mut p = position(Side::Sell);
        p.tp = Some(2442.0);
        // Sell from 2450 toward 2442: price 2446 → (2450-2446)/8 = 0.5
        assert!((p.progress_to_tp(2446.0).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn r_multiple_signed() {
        let p = position(Side::Buy);
        // risk = 4.0; price 2446 → -1R
        assert!((p.r_multiple(2446.0, 2446.0).unwrap() + 1.0).abs() < 1e-12);
        assert!((p.r_multiple(2454.0, 2446.0).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_distances_are_none() {
        let mut p = position(Side::Buy);
        p.tp = Some(p.entry_price);
        assert!(p.progress_to_tp(2452.0).is_none());
        assert!(p.r_multiple(2452.0, p.entry_price).is_none());
    }
}
