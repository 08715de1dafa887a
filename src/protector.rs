// =============================================================================
// Profit Protector / Loss Cutter — weighted warning scorer
// =============================================================================
//
// Independent of the exit manager, on a faster (~15 s) cadence. Seven
// technical warnings, each with a fixed weight, plus an order-flow bonus:
//
//   1. CHoCH against the position ............ 3
//   2. Opposite engulfing candle ............. 3
//   3. Liquidity rejection wick .............. 2
//   4. Momentum divergence ................... 2
//   5. Dynamic S/R break (EMA20/50) .......... 2
//   6. Momentum loss (ATR/ADX fade) .......... 1
//   7. Session shift (Friday PM) ............. 1
//   +  Large opposing order flow ............. 1
//
// Decision: score >= 5 EXIT; 2..5 TIGHTEN to a structure-based SL (only if
// strictly better, silent no-op otherwise); below 2 MONITOR. Losing
// positions get an early-exit path once R and the normalized score both
// cross their thresholds. A close is refused while spread/ATR exceeds the
// cap — wait for the book to normalize instead of paying a panic spread.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::broker::gateway::OrderGateway;
use crate::broker::Position;
use crate::events::{EventBus, EventRecord, Severity};
use crate::indicators::patterns;
use crate::indicators::structure::choch_against;
use crate::market_data::order_flow::{OrderFlowTracker, WhaleAdvisory};
use crate::market_data::{Candle, Snapshot, SnapshotHub, Timeframe};
use crate::runtime_config::EngineConfig;
use crate::session::is_friday_caution;
use crate::types::Side;

/// Evaluation cadence.
const CYCLE: Duration = Duration::from_secs(15);

/// Score at or above which the position is closed outright.
const EXIT_SCORE: u32 = 5;

/// Score at or above which the SL is tightened.
const TIGHTEN_SCORE: u32 = 2;

/// Buffer around the structure level, in ATR multiples.
const STRUCTURE_BUFFER_ATR: f64 = 0.5;

/// Bars considered for the structure-based stop.
const STRUCTURE_BARS: usize = 5;

/// Maximum possible weight sum, for score normalization.
const MAX_SCORE: u32 = 15;

/// One cycle's warning readings for a position.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WarningSignals {
    pub choch_against: bool,
    pub opposite_engulfing: bool,
    pub liquidity_rejection: bool,
    pub momentum_divergence: bool,
    pub dynamic_sr_break: bool,
    pub momentum_loss: bool,
    pub session_shift: bool,
    pub opposing_whale_flow: bool,
}

impl WarningSignals {
    pub fn score(&self) -> u32 {
        let mut score = 0;
        if self.choch_against {
            score += 3;
        }
        if self.opposite_engulfing {
            score += 3;
        }
        if self.liquidity_rejection {
            score += 2;
        }
        if self.momentum_divergence {
            score += 2;
        }
        if self.dynamic_sr_break {
            score += 2;
        }
        if self.momentum_loss {
            score += 1;
        }
        if self.session_shift {
            score += 1;
        }
        if self.opposing_whale_flow {
            score += 1;
        }
        score
    }

    /// Score scaled into [0, 1] for threshold comparisons.
    pub fn normalized(&self) -> f64 {
        self.score() as f64 / MAX_SCORE as f64
    }

    /// Compact reason string from the heavy (weight >= 2) signals, falling
    /// back to the strongest light one. Fits the broker comment budget.
    pub fn reason(&self) -> String {
        let mut parts = Vec::new();
        if self.choch_against {
            parts.push("choch");
        }
        if self.opposite_engulfing {
            parts.push("engulfing");
        }
        if self.liquidity_rejection {
            parts.push("rejection");
        }
        if self.momentum_divergence {
            parts.push("divergence");
        }
        if self.dynamic_sr_break {
            parts.push("sr_break");
        }
        if parts.is_empty() {
            if self.momentum_loss {
                parts.push("momentum");
            } else if self.session_shift {
                parts.push("session");
            } else if self.opposing_whale_flow {
                parts.push("whale");
            }
        }
        parts.join("+")
    }
}

/// The verdict for one position this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtectDecision {
    Monitor,
    Tighten(f64),
    Exit(String),
}

/// Everything `decide` needs about the position itself.
#[derive(Debug, Clone)]
pub struct ProtectInput {
    pub side: Side,
    pub entry: f64,
    pub current_sl: Option<f64>,
    pub price: f64,
    pub atr: Option<f64>,
    /// R multiple against the initial risk; `None` when it cannot be known.
    pub r: Option<f64>,
    /// Extreme of the last few bars — the structure anchor for tightening.
    pub recent_swing: Option<f64>,
}

// =============================================================================
// Signal detection
// =============================================================================

/// Read the warning set for a position out of the latest snapshot.
pub fn detect_signals(
    snapshot: &Snapshot,
    side: Side,
    whale: Option<&WhaleAdvisory>,
    now_ms: i64,
) -> WarningSignals {
    let m15 = snapshot.frame(Timeframe::M15);
    let features = m15.map(|f| &f.features);
    let candles: &[Candle] = m15.map(|f| f.candles.as_slice()).unwrap_or(&[]);
    let price = snapshot.last_price;

    let choch = features
        .map(|f| choch_against(&f.structure, side, STRUCTURE_BARS))
        .unwrap_or(false);

    let engulfing = patterns::opposite_engulfing(candles, side);

    let rejection = detect_liquidity_rejection(candles, features, side, price);

    let divergence = features
        .map(|f| detect_momentum_divergence(candles, f.rsi14, side))
        .unwrap_or(false);

    let sr_break = features
        .map(|f| {
            let (Some(close), Some(e20), Some(e50)) = (f.last_close, f.ema20, f.ema50) else {
                return false;
            };
            match side {
                Side::Buy => close < e20 && close < e50,
                Side::Sell => close > e20 && close > e50,
            }
        })
        .unwrap_or(false);

    let momentum_loss = features
        .map(|f| {
            let atr_fade = f.atr_expansion.map(|x| x < 0.85).unwrap_or(false);
            let adx_weak = f.adx.map(|a| a.adx < 20.0).unwrap_or(false);
            atr_fade || adx_weak
        })
        .unwrap_or(false);

    let session_shift = chrono::DateTime::<Utc>::from_timestamp_millis(now_ms)
        .map(is_friday_caution)
        .unwrap_or(false);

    let whale_opposing = whale
        .map(|w| w.direction == side.opposite())
        .unwrap_or(false);

    WarningSignals {
        choch_against: choch,
        opposite_engulfing: engulfing,
        liquidity_rejection: rejection,
        momentum_divergence: divergence,
        dynamic_sr_break: sr_break,
        momentum_loss,
        session_shift,
        opposing_whale_flow: whale_opposing,
    }
}

/// Rejection wick against the position at a marked liquidity level
/// (session high/low or previous-day high/low).
fn detect_liquidity_rejection(
    candles: &[Candle],
    features: Option<&crate::indicators::Features>,
    side: Side,
    price: Option<f64>,
) -> bool {
    let Some(wick_dir) = patterns::rejection_wick(candles) else {
        return false;
    };
    // For a BUY, the warning is a rejection of higher prices.
    if wick_dir != side {
        return false;
    }
    let (Some(features), Some(price)) = (features, price) else {
        return false;
    };
    let Some(atr) = features.atr14 else {
        return false;
    };
    let near = |level: Option<f64>| {
        level
            .map(|l| (price - l).abs() <= STRUCTURE_BUFFER_ATR * atr)
            .unwrap_or(false)
    };
    near(features.session_high)
        || near(features.session_low)
        || near(features.pdh)
        || near(features.pdl)
}

/// Price pushes to a new extreme while RSI refuses to follow, or RSI is
/// already pinned at an extreme.
fn detect_momentum_divergence(candles: &[Candle], rsi: Option<f64>, side: Side) -> bool {
    if let Some(rsi) = rsi {
        match side {
            Side::Buy if rsi > 70.0 => return true,
            Side::Sell if rsi < 30.0 => return true,
            _ => {}
        }
    }
    if candles.len() < 10 {
        return false;
    }
    let recent = &candles[candles.len() - 5..];
    let earlier = &candles[candles.len() - 10..candles.len() - 5];
    let recent_extreme = match side {
        Side::Buy => recent.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        Side::Sell => recent.iter().map(|c| c.low).fold(f64::MAX, f64::min),
    };
    let earlier_extreme = match side {
        Side::Buy => earlier.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        Side::Sell => earlier.iter().map(|c| c.low).fold(f64::MAX, f64::min),
    };
    let price_pushed = match side {
        Side::Buy => recent_extreme > earlier_extreme,
        Side::Sell => recent_extreme < earlier_extreme,
    };
    // Momentum refusing to follow shows up as a mid-range RSI on the push.
    let rsi_lagging = rsi.map(|r| (40.0..60.0).contains(&r)).unwrap_or(false);
    price_pushed && rsi_lagging
}

/// Extreme of the last `STRUCTURE_BARS` complete bars, as the structure
/// anchor for a tightened stop.
pub fn recent_swing(candles: &[Candle], side: Side) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    let window = &candles[candles.len().saturating_sub(STRUCTURE_BARS)..];
    match side {
        Side::Buy => window.iter().map(|c| c.low).fold(None, |acc: Option<f64>, l| {
            Some(acc.map_or(l, |a| a.min(l)))
        }),
        Side::Sell => window.iter().map(|c| c.high).fold(None, |acc: Option<f64>, h| {
            Some(acc.map_or(h, |a| a.max(h)))
        }),
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Fold the warning score into a verdict.
pub fn decide(
    signals: &WarningSignals,
    input: &ProtectInput,
    early_exit_r: f64,
    risk_score_threshold: f64,
) -> ProtectDecision {
    let score = signals.score();

    // Early exit for losers: deep underwater and the tape confirms.
    if let Some(r) = input.r {
        if r <= early_exit_r && signals.normalized() >= risk_score_threshold {
            return ProtectDecision::Exit(format!("early_exit:{}", signals.reason()));
        }
    }

    if score >= EXIT_SCORE {
        return ProtectDecision::Exit(signals.reason());
    }

    if score >= TIGHTEN_SCORE {
        let Some(atr) = input.atr else {
            return ProtectDecision::Monitor;
        };
        let buffer = STRUCTURE_BUFFER_ATR * atr;
        let candidate = match input.recent_swing {
            Some(swing) => swing - input.side.sign() * buffer,
            None => input.entry - input.side.sign() * buffer,
        };
        let improves = match (input.side, input.current_sl) {
            (Side::Buy, Some(sl)) => candidate > sl,
            (Side::Sell, Some(sl)) => candidate < sl,
            (_, None) => true,
        };
        // Never hand the broker a stop on the wrong side of the market.
        let legal = match input.side {
            Side::Buy => candidate < input.price,
            Side::Sell => candidate > input.price,
        };
        if improves && legal {
            return ProtectDecision::Tighten(candidate);
        }
        // Non-improving tighten is a silent no-op.
        return ProtectDecision::Monitor;
    }

    ProtectDecision::Monitor
}

// =============================================================================
// Protector loop
// =============================================================================

pub struct Protector {
    gateway: Arc<OrderGateway>,
    hub: Arc<SnapshotHub>,
    flow: Arc<OrderFlowTracker>,
    config: Arc<RwLock<EngineConfig>>,
    events: EventBus,
    positions_mirror: Arc<RwLock<Vec<Position>>>,
}

impl Protector {
    pub fn new(
        gateway: Arc<OrderGateway>,
        hub: Arc<SnapshotHub>,
        flow: Arc<OrderFlowTracker>,
        config: Arc<RwLock<EngineConfig>>,
        events: EventBus,
        positions_mirror: Arc<RwLock<Vec<Position>>>,
    ) -> Self {
        Self {
            gateway,
            hub,
            flow,
            config,
            events,
            positions_mirror,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(cycle_secs = CYCLE.as_secs(), "profit protector started");
        let mut ticker = interval(CYCLE);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    pub async fn cycle(&self) {
        let positions = self.positions_mirror.read().clone();
        if positions.is_empty() {
            return;
        }
        let (early_exit_r, risk_score_threshold, spread_atr_cap) = {
            let cfg = self.config.read();
            (cfg.early_exit_r, cfg.risk_score_threshold, cfg.spread_atr_cap)
        };

        for position in positions {
            let Some(snapshot) = self.hub.latest(&position.symbol) else {
                continue;
            };
            let whale = self.flow.whale(&position.symbol);
            let signals =
                detect_signals(&snapshot, position.side, whale.as_ref(), snapshot.as_of_ms);

            let m15 = snapshot.frame(Timeframe::M15);
            let atr = snapshot
                .atr(Timeframe::H1)
                .or_else(|| snapshot.atr(Timeframe::M15));
            let price = snapshot.last_price.unwrap_or(position.entry_price);
            let input = ProtectInput {
                side: position.side,
                entry: position.entry_price,
                current_sl: position.sl,
                price,
                atr,
                r: position
                    .sl
                    .and_then(|sl| position.r_multiple(price, sl)),
                recent_swing: m15
                    .and_then(|f| recent_swing(&f.candles, position.side)),
            };

            let decision = decide(&signals, &input, early_exit_r, risk_score_threshold);
            match decision {
                ProtectDecision::Monitor => {
                    debug!(
                        ticket = position.ticket,
                        score = signals.score(),
                        "protector: monitoring"
                    );
                }
                ProtectDecision::Tighten(new_sl) => {
                    let retcode = self.gateway.modify_sl(position.ticket, new_sl).await;
                    info!(
                        ticket = position.ticket,
                        new_sl,
                        score = signals.score(),
                        retcode = %retcode,
                        "protector: SL tightened"
                    );
                    self.events.publish(
                        EventRecord::action("protector", "sl_tightened")
                            .with_symbol(position.symbol.clone())
                            .with_ticket(position.ticket)
                            .with_payload(serde_json::json!({
                                "new_sl": new_sl,
                                "score": signals.score(),
                                "signals": signals,
                            })),
                    );
                }
                ProtectDecision::Exit(reason) => {
                    // Spread guard: closing into a blown-out book locks in a
                    // worse price than waiting.
                    let spread_ok = match (snapshot.spread, atr) {
                        (Some(spread), Some(atr)) if atr > 0.0 => {
                            spread / atr <= spread_atr_cap
                        }
                        _ => true,
                    };
                    if !spread_ok {
                        warn!(
                            ticket = position.ticket,
                            "protector: exit wanted but spread too wide — waiting"
                        );
                        self.events.publish(
                            EventRecord::action("protector", "exit_deferred_spread")
                                .with_symbol(position.symbol.clone())
                                .with_ticket(position.ticket)
                                .with_severity(Severity::Warning),
                        );
                        continue;
                    }
                    let retcode = self
                        .gateway
                        .close_position(position.ticket, None, &reason)
                        .await;
                    info!(
                        ticket = position.ticket,
                        reason = %reason,
                        score = signals.score(),
                        retcode = %retcode,
                        "protector: position closed"
                    );
                    self.events.publish(
                        EventRecord::action("protector", "position_exited")
                            .with_symbol(position.symbol.clone())
                            .with_ticket(position.ticket)
                            .with_payload(serde_json::json!({
                                "reason": reason,
                                "score": signals.score(),
                                "signals": signals,
                            }))
                            .with_severity(Severity::Warning),
                    );
                }
            }
        }
    }
}
