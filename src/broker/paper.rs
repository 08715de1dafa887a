// =============================================================================
// Paper Broker — in-memory terminal simulation
// =============================================================================
//
// Used by demo mode, dry-run order paths, and every test that needs a broker.
// Fill model: market orders fill at the touch immediately; pending orders
// fill when a pushed quote crosses the trigger; SL/TP close positions on the
// quote that crosses them. No partial fills, no slippage.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::market_data::{Candle, Tick, Timeframe};
use crate::types::{OrderKind, RetCode, Side};

use super::{BrokerGateway, OrderAck, OrderRequest, PendingOrder, Position, SymbolInfo};

pub struct PaperBroker {
    quotes: RwLock<HashMap<String, Tick>>,
    positions: RwLock<HashMap<u64, Position>>,
    pendings: RwLock<HashMap<u64, PendingOrder>>,
    closed: RwLock<Vec<(Position, String)>>,
    subscribers: RwLock<Vec<mpsc::Sender<Tick>>>,
    next_ticket: AtomicU64,
    /// When set, the next `place_order` returns this retcode once.
    fail_next: RwLock<Option<RetCode>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            pendings: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            next_ticket: AtomicU64::new(1000),
            fail_next: RwLock::new(None),
        }
    }

    /// Push a quote into the simulation: updates the book, triggers pending
    /// fills and SL/TP closes, and fans the tick out to subscribers.
    pub fn push_quote(&self, tick: Tick) {
        self.quotes.write().insert(tick.symbol.clone(), tick.clone());
        self.trigger_pendings(&tick);
        self.trigger_stops(&tick);

        let subscribers = self.subscribers.read();
        for tx in subscribers.iter() {
            let _ = tx.try_send(tick.clone());
        }
    }

    /// Force the next `place_order` call to fail with `retcode`.
    pub fn fail_next_order(&self, retcode: RetCode) {
        *self.fail_next.write() = Some(retcode);
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn closed_positions(&self) -> Vec<(Position, String)> {
        self.closed.read().clone()
    }

    pub fn position(&self, ticket: u64) -> Option<Position> {
        self.positions.read().get(&ticket).cloned()
    }

    fn trigger_pendings(&self, tick: &Tick) {
        let mut fills = Vec::new();
        {
            let pendings = self.pendings.read();
            for order in pendings.values().filter(|o| o.symbol == tick.symbol) {
                let crossed = match (order.order_type, order.side) {
                    (OrderKind::Stop, Side::Buy) => tick.ask >= order.entry,
                    (OrderKind::Stop, Side::Sell) => tick.bid <= order.entry,
                    (OrderKind::Limit, Side::Buy) => tick.ask <= order.entry,
                    (OrderKind::Limit, Side::Sell) => tick.bid >= order.entry,
                    (OrderKind::Market, _) => true,
                };
                if crossed {
                    fills.push(order.ticket);
                }
            }
        }
        for ticket in fills {
            if let Some(order) = self.pendings.write().remove(&ticket) {
                info!(ticket, symbol = %order.symbol, "paper pending order filled");
                self.positions.write().insert(
                    ticket,
                    Position {
                        ticket,
                        symbol: order.symbol,
                        side: order.side,
                        volume: order.volume,
                        entry_price: order.entry,
                        sl: Some(order.sl),
                        tp: Some(order.tp),
                        opened_at_ms: tick.epoch_ms,
                        magic: 0,
                    },
                );
            }
        }
    }

    fn trigger_stops(&self, tick: &Tick) {
        let mut closes = Vec::new();
        {
            let positions = self.positions.read();
            for p in positions.values().filter(|p| p.symbol == tick.symbol) {
                let mark = match p.side {
                    Side::Buy => tick.bid,
                    Side::Sell => tick.ask,
                };
                if let Some(sl) = p.sl {
                    let hit = match p.side {
                        Side::Buy => mark <= sl,
                        Side::Sell => mark >= sl,
                    };
                    if hit {
                        closes.push((p.ticket, "sl"));
                        continue;
                    }
                }
                if let Some(tp) = p.tp {
                    let hit = match p.side {
                        Side::Buy => mark >= tp,
                        Side::Sell => mark <= tp,
                    };
                    if hit {
                        closes.push((p.ticket, "tp"));
                    }
                }
            }
        }
        for (ticket, reason) in closes {
            if let Some(p) = self.positions.write().remove(&ticket) {
                info!(ticket, reason, "paper position closed by stop");
                self.closed.write().push((p, reason.to_string()));
            }
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn subscribe_ticks(&self, _symbols: &[String]) -> Result<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.write().push(tx);
        Ok(rx)
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _tf: Timeframe,
        _count: usize,
    ) -> Result<Vec<Candle>> {
        // The paper broker has no history of its own; warm-up comes from the
        // live bridge or from test fixtures pushed directly into the rings.
        Ok(Vec::new())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.read().values().cloned().collect())
    }

    async fn list_pending_orders(&self) -> Result<Vec<PendingOrder>> {
        Ok(self.pendings.read().values().cloned().collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if let Some(retcode) = self.fail_next.write().take() {
            debug!(retcode = %retcode, "paper broker: injected failure");
            return Ok(OrderAck {
                ticket: 0,
                retcode,
                fill_price: None,
            });
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        match request.order_type {
            OrderKind::Market => {
                let quote = self
                    .quotes
                    .read()
                    .get(&request.symbol)
                    .cloned();
                let Some(quote) = quote else {
                    bail!("no quote for {}", request.symbol);
                };
                let fill = match request.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                self.positions.write().insert(
                    ticket,
                    Position {
                        ticket,
                        symbol: request.symbol.clone(),
                        side: request.side,
                        volume: request.volume,
                        entry_price: fill,
                        sl: Some(request.sl),
                        tp: Some(request.tp),
                        opened_at_ms: quote.epoch_ms,
                        magic: request.magic,
                    },
                );
                info!(ticket, symbol = %request.symbol, fill, "paper market order filled");
                Ok(OrderAck {
                    ticket,
                    retcode: RetCode::Ok,
                    fill_price: Some(fill),
                })
            }
            OrderKind::Limit | OrderKind::Stop => {
                let entry = request
                    .entry
                    .ok_or_else(|| anyhow::anyhow!("pending order without entry"))?;
                self.pendings.write().insert(
                    ticket,
                    PendingOrder {
                        ticket,
                        symbol: request.symbol.clone(),
                        side: request.side,
                        order_type: request.order_type,
                        entry,
                        sl: request.sl,
                        tp: request.tp,
                        volume: request.volume,
                    },
                );
                info!(ticket, symbol = %request.symbol, entry, "paper pending order placed");
                Ok(OrderAck {
                    ticket,
                    retcode: RetCode::Ok,
                    fill_price: None,
                })
            }
        }
    }

    async fn modify_position(
        &self,
        ticket: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<RetCode> {
        let mut positions = self.positions.write();
        match positions.get_mut(&ticket) {
            Some(p) => {
                if sl.is_some() {
                    p.sl = sl;
                }
                if tp.is_some() {
                    p.tp = tp;
                }
                Ok(RetCode::Ok)
            }
            None => Ok(RetCode::Rejected("position not found".into())),
        }
    }

    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<f64>,
        comment: &str,
    ) -> Result<RetCode> {
        let mut positions = self.positions.write();
        let Some(current_volume) = positions.get(&ticket).map(|p| p.volume) else {
            return Ok(RetCode::Rejected("position not found".into()));
        };

        let close_volume = volume.unwrap_or(current_volume).min(current_volume);
        if close_volume < current_volume - f64::EPSILON {
            if let Some(p) = positions.get_mut(&ticket) {
                p.volume -= close_volume;
                info!(ticket, close_volume, remaining = p.volume, "paper partial close");
            }
        } else if let Some(p) = positions.remove(&ticket) {
            info!(ticket, comment, "paper full close");
            self.closed.write().push((p, comment.to_string()));
        }
        Ok(RetCode::Ok)
    }

    async fn cancel_order(&self, ticket: u64) -> Result<RetCode> {
        match self.pendings.write().remove(&ticket) {
            Some(_) => Ok(RetCode::Ok),
            None => Ok(RetCode::Rejected("order not found".into())),
        }
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        // Reasonable defaults by asset class.
        let info = if symbol.contains("BTC") {
            SymbolInfo {
                digits: 2,
                point: 0.01,
                volume_min: 0.01,
                volume_max: 10.0,
                volume_step: 0.01,
                spread: 20.0,
                tick_value: 0.01,
            }
        } else if symbol.contains("XAU") {
            SymbolInfo {
                digits: 2,
                point: 0.01,
                volume_min: 0.01,
                volume_max: 20.0,
                volume_step: 0.01,
                spread: 0.35,
                tick_value: 1.0,
            }
        } else {
            SymbolInfo {
                digits: 5,
                point: 0.00001,
                volume_min: 0.01,
                volume_max: 50.0,
                volume_step: 0.01,
                spread: 0.00012,
                tick_value: 1.0,
            }
        };
        Ok(info)
    }

    async fn current_quote(&self, symbol: &str) -> Result<Tick> {
        self.quotes
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no quote for {symbol}"))
    }
}
