// =============================================================================
// Order Gateway Adapter — decisions in, terminal-safe requests out
// =============================================================================
//
// Hard rules enforced here, because the terminal enforces them silently:
//
//   - Order comments are truncated to 31 bytes (UTF-8 boundary safe).
//   - Every request carries a time-in-force (`GTC`).
//   - Market orders are priced at the live touch, never the advisor's stale
//     entry; SL/TP are re-validated against the live price and a failed
//     re-validation rejects with `market_moved`.
//   - Volume defaults to risk-based sizing under the per-class caps;
//     an advisor volume wins only when it fits under the cap.
//   - Only TRANSIENT outcomes retry, on the configured backoff schedule.
//
// All broker calls are serialized behind one internal mutex: the terminal
// client is not safe under concurrent access.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::decision::TradeSpec;
use crate::events::{EventBus, EventRecord, Severity};
use crate::runtime_config::EngineConfig;
use crate::types::{OrderKind, RetCode, Side};

use super::{BrokerGateway, OrderAck, OrderRequest, SymbolInfo};

/// Hard terminal limit on order comments, in bytes.
pub const COMMENT_LIMIT: usize = 31;

/// Query-style broker calls must answer within this budget.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Trade actions get a little longer.
const TRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a submission attempt.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Placed(OrderAck),
    /// Hard rejection with reason; never retried.
    Rejected(String),
    /// Transient failure that exhausted its retry budget.
    Failed(String),
}

impl SubmitOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Placed(_))
    }
}

/// Truncate a comment to the terminal's 31-byte limit without splitting a
/// UTF-8 code point.
pub fn truncate_comment(comment: &str) -> String {
    if comment.len() <= COMMENT_LIMIT {
        return comment.to_string();
    }
    let mut end = COMMENT_LIMIT;
    while end > 0 && !comment.is_char_boundary(end) {
        end -= 1;
    }
    comment[..end].to_string()
}

/// The single chokepoint between the engine and the terminal.
pub struct OrderGateway {
    broker: Arc<dyn BrokerGateway>,
    config: Arc<RwLock<EngineConfig>>,
    events: EventBus,
    call_guard: Mutex<()>,
    dry_run: AtomicBool,
    synthetic_ticket: AtomicU64,
}

impl OrderGateway {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        config: Arc<RwLock<EngineConfig>>,
        events: EventBus,
    ) -> Self {
        Self {
            broker,
            config,
            events,
            call_guard: Mutex::new(()),
            dry_run: AtomicBool::new(false),
            synthetic_ticket: AtomicU64::new(900_000),
        }
    }

    /// Dry-run short-circuits the terminal and returns synthetic acks.
    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::SeqCst);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Resolve and submit an emitted trade spec.
    pub async fn submit(&self, spec: &TradeSpec) -> SubmitOutcome {
        let info = {
            let _guard = self.call_guard.lock().await;
            match timeout(QUERY_TIMEOUT, self.broker.symbol_info(&spec.symbol)).await {
                Ok(Ok(info)) => info,
                Ok(Err(e)) => return SubmitOutcome::Failed(format!("symbol_info: {e}")),
                Err(_) => return SubmitOutcome::Failed("symbol_info timeout".into()),
            }
        };

        let volume = self.resolve_volume(spec, &info);

        // Market orders re-price at the live touch.
        let (entry, sl, tp) = match spec.order_type {
            OrderKind::Market => {
                let quote = {
                    let _guard = self.call_guard.lock().await;
                    match timeout(QUERY_TIMEOUT, self.broker.current_quote(&spec.symbol)).await {
                        Ok(Ok(q)) => q,
                        Ok(Err(e)) => return SubmitOutcome::Failed(format!("quote: {e}")),
                        Err(_) => return SubmitOutcome::Failed("quote timeout".into()),
                    }
                };
                let live = match spec.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                let still_valid = match spec.side {
                    Side::Buy => spec.sl < live && live < spec.tp,
                    Side::Sell => spec.sl > live && live > spec.tp,
                };
                if !still_valid {
                    info!(
                        symbol = %spec.symbol,
                        advisor_entry = spec.entry,
                        live,
                        "market moved past SL/TP — rejecting market order"
                    );
                    self.events.publish(
                        EventRecord::action("gateway", "order_rejected")
                            .with_symbol(spec.symbol.clone())
                            .with_payload(serde_json::json!({
                                "reason": "market_moved",
                                "advisor_entry": spec.entry,
                                "live": live,
                            }))
                            .with_severity(Severity::Warning),
                    );
                    return SubmitOutcome::Rejected("market_moved".into());
                }
                (None, spec.sl, spec.tp)
            }
            // Pending orders keep the advisor's entry.
            _ => (Some(spec.entry), spec.sl, spec.tp),
        };

        let comment = truncate_comment(&format!(
            "mrd:{}",
            spec.template_name.as_deref().unwrap_or("manual")
        ));
        let magic = self.config.read().magic;
        let request = OrderRequest {
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            entry,
            sl,
            tp,
            volume,
            comment,
            type_time: "GTC",
            magic,
        };

        if self.is_dry_run() {
            let ticket = self.synthetic_ticket.fetch_add(1, Ordering::SeqCst);
            debug!(symbol = %spec.symbol, ticket, "dry-run: synthetic order ack");
            return SubmitOutcome::Placed(OrderAck {
                ticket,
                retcode: RetCode::Ok,
                fill_price: entry,
            });
        }

        let (retry_max, backoff) = {
            let cfg = self.config.read();
            (cfg.pos_close_retry_max, cfg.backoff_schedule())
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = {
                let _guard = self.call_guard.lock().await;
                timeout(TRADE_TIMEOUT, self.broker.place_order(&request)).await
            };

            let retcode = match &result {
                Ok(Ok(ack)) if ack.retcode.is_ok() => {
                    info!(
                        symbol = %request.symbol,
                        ticket = ack.ticket,
                        volume = request.volume,
                        attempt,
                        "order placed"
                    );
                    self.events.publish(
                        EventRecord::action("gateway", "order_placed")
                            .with_symbol(request.symbol.clone())
                            .with_ticket(ack.ticket)
                            .with_payload(serde_json::json!({
                                "side": request.side.to_string(),
                                "order_type": request.order_type.to_string(),
                                "volume": request.volume,
                            })),
                    );
                    return SubmitOutcome::Placed(ack.clone());
                }
                Ok(Ok(ack)) => ack.retcode.clone(),
                Ok(Err(e)) => {
                    warn!(symbol = %request.symbol, error = %e, attempt, "order transport error");
                    RetCode::Transient
                }
                Err(_) => RetCode::Timeout,
            };

            match retcode {
                RetCode::Rejected(reason) => {
                    self.events.publish(
                        EventRecord::action("gateway", "order_rejected")
                            .with_symbol(request.symbol.clone())
                            .with_payload(serde_json::json!({"reason": reason}))
                            .with_severity(Severity::Warning),
                    );
                    return SubmitOutcome::Rejected(reason);
                }
                _ if attempt > retry_max => {
                    return SubmitOutcome::Failed(format!(
                        "exhausted {retry_max} retries ({retcode})"
                    ));
                }
                _ => {
                    let wait = backoff
                        .get((attempt - 1) as usize)
                        .copied()
                        .unwrap_or_else(|| *backoff.last().unwrap_or(&900));
                    debug!(attempt, wait_ms = wait, "transient order failure — backing off");
                    sleep(Duration::from_millis(wait)).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position maintenance (used by the exit manager and loss cutter)
    // -------------------------------------------------------------------------

    pub async fn modify_sl(&self, ticket: u64, sl: f64) -> RetCode {
        if self.is_dry_run() {
            return RetCode::Ok;
        }
        self.with_retries("modify_sl", || async move {
            let _guard = self.call_guard.lock().await;
            match timeout(TRADE_TIMEOUT, self.broker.modify_position(ticket, Some(sl), None)).await
            {
                Ok(Ok(ret)) => ret,
                Ok(Err(_)) => RetCode::Transient,
                Err(_) => RetCode::Timeout,
            }
        })
        .await
    }

    pub async fn close_position(&self, ticket: u64, volume: Option<f64>, reason: &str) -> RetCode {
        if self.is_dry_run() {
            return RetCode::Ok;
        }
        let comment = truncate_comment(reason);
        self.with_retries("close_position", || {
            let comment = comment.clone();
            async move {
                let _guard = self.call_guard.lock().await;
                match timeout(
                    TRADE_TIMEOUT,
                    self.broker.close_position(ticket, volume, &comment),
                )
                .await
                {
                    Ok(Ok(ret)) => ret,
                    Ok(Err(_)) => RetCode::Transient,
                    Err(_) => RetCode::Timeout,
                }
            }
        })
        .await
    }

    pub async fn cancel_order(&self, ticket: u64) -> RetCode {
        if self.is_dry_run() {
            return RetCode::Ok;
        }
        self.with_retries("cancel_order", || async move {
            let _guard = self.call_guard.lock().await;
            match timeout(TRADE_TIMEOUT, self.broker.cancel_order(ticket)).await {
                Ok(Ok(ret)) => ret,
                Ok(Err(_)) => RetCode::Transient,
                Err(_) => RetCode::Timeout,
            }
        })
        .await
    }

    async fn with_retries<F, Fut>(&self, op: &'static str, call: F) -> RetCode
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = RetCode>,
    {
        let (retry_max, backoff) = {
            let cfg = self.config.read();
            (cfg.pos_close_retry_max, cfg.backoff_schedule())
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let ret = call().await;
            if ret.is_ok() || !ret.is_transient() || attempt > retry_max {
                if !ret.is_ok() {
                    warn!(op, attempt, retcode = %ret, "broker call did not succeed");
                }
                return ret;
            }
            let wait = backoff
                .get((attempt - 1) as usize)
                .copied()
                .unwrap_or_else(|| *backoff.last().unwrap_or(&900));
            sleep(Duration::from_millis(wait)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    fn resolve_volume(&self, spec: &TradeSpec, info: &SymbolInfo) -> f64 {
        let cfg = self.config.read();
        let cap = cfg.volume_cap(&spec.symbol).min(info.volume_max);

        if let Some(requested) = spec.volume {
            if requested <= cap {
                return round_to_step(requested.max(info.volume_min), info.volume_step);
            }
            debug!(
                symbol = %spec.symbol,
                requested,
                cap,
                "advisor volume above cap — capping"
            );
            return round_to_step(cap, info.volume_step);
        }

        // Risk-based default: lose at most risk_per_trade_pct of equity when
        // the SL is hit.
        let risk_amount = cfg.account_equity * cfg.risk_per_trade_pct / 100.0;
        let risk_points = spec.risk_distance() / info.point;
        let loss_per_lot = risk_points * info.tick_value;
        let volume = if loss_per_lot > 0.0 {
            risk_amount / loss_per_lot
        } else {
            info.volume_min
        };
        round_to_step(volume.clamp(info.volume_min, cap), info.volume_step)
    }
}

fn round_to_step(volume: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return volume;
    }
    ((volume / step) + 1e-9).floor() * step
}

// =============================================================================
// Command queue — the hot path posts here and never awaits the broker
// =============================================================================

#[derive(Debug)]
pub enum OrderCommand {
    Place(TradeSpec),
    ModifySl { ticket: u64, sl: f64 },
    Close {
        ticket: u64,
        volume: Option<f64>,
        reason: String,
    },
    Cancel { ticket: u64 },
}

/// Drain the order queue until every sender is gone.
pub async fn run_order_queue(mut rx: mpsc::Receiver<OrderCommand>, gateway: Arc<OrderGateway>) {
    info!("order queue task started");
    while let Some(command) = rx.recv().await {
        match command {
            OrderCommand::Place(spec) => {
                let outcome = gateway.submit(&spec).await;
                debug!(symbol = %spec.symbol, placed = outcome.is_placed(), "queued order resolved");
            }
            OrderCommand::ModifySl { ticket, sl } => {
                gateway.modify_sl(ticket, sl).await;
            }
            OrderCommand::Close {
                ticket,
                volume,
                reason,
            } => {
                gateway.close_position(ticket, volume, &reason).await;
            }
            OrderCommand::Cancel { ticket } => {
                gateway.cancel_order(ticket).await;
            }
        }
    }
    info!("order queue drained — task stopping");
}
