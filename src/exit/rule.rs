// =============================================================================
// Exit Rule — per-position state machine: breakeven → partial → trailing
// =============================================================================
//
// States are strictly ordered:
//
//   INIT < BE_ARMED < PARTIAL_TAKEN < TRAILING < CLOSED
//
// Transitions (R = unrealized profit as a fraction of distance-to-TP):
//
//   INIT → BE_ARMED          R >= breakeven_pct; SL moves to entry ± tick.
//   BE_ARMED → PARTIAL_TAKEN R >= partial_pct AND volume >= 0.02; closes
//                            partial_close_fraction of volume.
//   BE_ARMED|PARTIAL_TAKEN → TRAILING   all trailing gates pass.
//   any → CLOSED             broker-observed closure.
//
// A partial skipped for volume < 0.02 permits BE_ARMED → TRAILING directly.
//
// The rule only *plans* actions; the manager applies them against the broker
// and confirms each success back into the rule. This keeps the invariants —
// SL never retreats after BE_ARMED, states never regress — in one place,
// testable without a broker.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::vwap::VwapZone;
use crate::types::Side;

/// Positions below this volume skip the partial close.
pub const MIN_PARTIAL_VOLUME: f64 = 0.02;

/// R threshold that substitutes for a taken partial in the trailing gates.
const TRAILING_R_FALLBACK: f64 = 0.6;

/// Maximum |EMA200 stretch| (in ATR) tolerated by the mean-reversion gate.
const STRETCH_LIMIT: f64 = 2.0;

/// Minimum distance from the nearest high-volume node, in ATR multiples.
const HVN_GATE_ATR: f64 = 0.3;

/// Scale applied to BE/partial thresholds when the tape looks stretched.
const TIGHTEN_SCALE: f64 = 0.7;

/// Trailing distance multiplier granted to quality trends.
const QUALITY_TRAIL_BONUS: f64 = 1.25;

/// Extra SL room (in ATR) granted once when the volatility index spikes.
const VIX_WIDEN_ATR: f64 = 0.5;

/// Consecutive critical failures before the rule is quarantined.
pub const QUARANTINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    Init,
    BeArmed,
    PartialTaken,
    Trailing,
    Closed,
}

impl ExitState {
    /// Position in the monotone state order.
    pub fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::BeArmed => 1,
            Self::PartialTaken => 2,
            Self::Trailing => 3,
            Self::Closed => 4,
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::BeArmed => write!(f, "BE_ARMED"),
            Self::PartialTaken => write!(f, "PARTIAL_TAKEN"),
            Self::Trailing => write!(f, "TRAILING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Market context for one evaluation cycle.
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub price: f64,
    pub atr: Option<f64>,
    /// Low-volatility compression; trailing never engages inside one.
    pub squeeze: bool,
    pub vix: Option<f64>,
    /// EMA-stack agreement among {M5, M15, H1} with the position direction.
    pub mtf_alignment: u8,
    pub ema200_stretch_atr: Option<f64>,
    pub vwap_zone: Option<VwapZone>,
    /// Price distance to the nearest high-volume node.
    pub hvn_distance: Option<f64>,
    /// Momentum readings contradict the price push.
    pub fake_momentum: bool,
    /// EMA50/200 slopes aligned with the trade and stretch normal.
    pub quality_trend: bool,
    pub safety_tick: f64,
    /// Current position volume (shrinks after a partial).
    pub volume: f64,
}

/// An action the manager must execute against the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    MoveSl { to: f64, note: &'static str },
    PartialClose { volume: f64 },
}

/// Per-position managed exit state. Persisted on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRule {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub initial_sl: f64,
    pub initial_tp: f64,
    pub breakeven_pct: f64,
    pub partial_pct: f64,
    pub partial_close_fraction: f64,
    pub trailing_enabled: bool,
    pub trailing_distance_atr_mult: f64,
    pub vix_threshold: f64,
    pub state: ExitState,
    /// The engine's view of the live SL.
    pub current_sl: f64,
    #[serde(default)]
    pub last_trailing_sl: Option<f64>,
    #[serde(default)]
    pub vix_widened: bool,
    /// Set when the partial was skipped for volume; unlocks direct trailing.
    #[serde(default)]
    pub partial_skipped: bool,
    /// Sticky record that a partial was executed, kept across the TRAILING
    /// transition for the gate check.
    #[serde(default)]
    pub partial_taken: bool,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub quarantined: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ExitRule {
    /// Build a rule for a fresh position. Config thresholds are clamped to
    /// their documented bands.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticket: u64,
        symbol: impl Into<String>,
        side: Side,
        entry: f64,
        initial_sl: f64,
        initial_tp: f64,
        breakeven_pct: f64,
        partial_pct: f64,
        partial_close_fraction: f64,
        trailing_enabled: bool,
        trailing_distance_atr_mult: f64,
        vix_threshold: f64,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            ticket,
            symbol: symbol.into(),
            side,
            entry,
            initial_sl,
            initial_tp,
            breakeven_pct: breakeven_pct.clamp(0.20, 0.30),
            partial_pct: partial_pct.clamp(0.40, 0.60),
            partial_close_fraction,
            trailing_enabled,
            trailing_distance_atr_mult,
            vix_threshold,
            state: ExitState::Init,
            current_sl: initial_sl,
            last_trailing_sl: None,
            vix_widened: false,
            partial_skipped: false,
            partial_taken: false,
            degraded: false,
            consecutive_failures: 0,
            quarantined: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Unrealized progress toward TP in [−∞, ∞], 1.0 = at TP.
    pub fn progress(&self, price: f64) -> f64 {
        let distance = (self.initial_tp - self.entry).abs();
        if distance <= f64::EPSILON {
            return 0.0;
        }
        self.side.sign() * (price - self.entry) / distance
    }

    fn improves_sl(&self, candidate: f64) -> bool {
        match self.side {
            Side::Buy => candidate > self.current_sl,
            Side::Sell => candidate < self.current_sl,
        }
    }

    /// Effective BE/partial thresholds after adaptive tightening.
    fn effective_thresholds(&self, ctx: &ExitContext) -> (f64, f64) {
        let stretched = ctx
            .ema200_stretch_atr
            .map(|s| s.abs() > STRETCH_LIMIT)
            .unwrap_or(false)
            || ctx.vwap_zone == Some(VwapZone::Outer)
            || ctx.fake_momentum;
        if stretched {
            (
                self.breakeven_pct * TIGHTEN_SCALE,
                self.partial_pct * TIGHTEN_SCALE,
            )
        } else {
            (self.breakeven_pct, self.partial_pct)
        }
    }

    /// Do all trailing gates pass for this cycle?
    pub fn trailing_gates_pass(&self, ctx: &ExitContext) -> bool {
        if !self.trailing_enabled {
            return false;
        }
        let r = self.progress(ctx.price);

        // Gate 1: partial already taken, or R deep enough to stand in for it.
        if !self.partial_taken && r < TRAILING_R_FALLBACK {
            return false;
        }
        // Gate 2: never trail inside a compression.
        if ctx.squeeze {
            return false;
        }
        // Gate 3: multi-timeframe agreement.
        if ctx.mtf_alignment < 2 {
            return false;
        }
        // Gate 4: mean-reversion risk bounded. Unavailable readings fail the
        // gate; trailing pauses rather than trusting a blind spot.
        match ctx.ema200_stretch_atr {
            Some(stretch) if stretch.abs() <= STRETCH_LIMIT => {}
            _ => return false,
        }
        if ctx.vwap_zone.map_or(true, |z| z == VwapZone::Outer) {
            return false;
        }
        // Gate 5: room from the nearest high-volume node.
        match (ctx.hvn_distance, ctx.atr) {
            (Some(distance), Some(atr)) if distance >= HVN_GATE_ATR * atr => {}
            _ => return false,
        }
        true
    }

    /// Plan this cycle's actions. Pure: the rule is not mutated.
    pub fn plan(&self, ctx: &ExitContext) -> Vec<ExitAction> {
        if self.quarantined || self.state == ExitState::Closed {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let r = self.progress(ctx.price);
        let (be_pct, partial_pct) = self.effective_thresholds(ctx);

        // One-time VIX widening, strictly before BE.
        if self.state == ExitState::Init && !self.vix_widened {
            if let (Some(vix), Some(atr)) = (ctx.vix, ctx.atr) {
                if vix > self.vix_threshold {
                    let widened = self.initial_sl - self.side.sign() * VIX_WIDEN_ATR * atr;
                    actions.push(ExitAction::MoveSl {
                        to: widened,
                        note: "vix_widen",
                    });
                }
            }
        }

        match self.state {
            ExitState::Init => {
                if r >= be_pct {
                    let be_sl = self.entry + self.side.sign() * ctx.safety_tick;
                    actions.push(ExitAction::MoveSl {
                        to: be_sl,
                        note: "breakeven",
                    });
                }
            }
            ExitState::BeArmed => {
                if r >= partial_pct
                    && !self.partial_skipped
                    && ctx.volume >= MIN_PARTIAL_VOLUME
                {
                    actions.push(ExitAction::PartialClose {
                        volume: ctx.volume * self.partial_close_fraction,
                    });
                } else if self.trailing_gates_pass(ctx) {
                    if let Some(action) = self.trail_action(ctx) {
                        actions.push(action);
                    }
                }
            }
            ExitState::PartialTaken | ExitState::Trailing => {
                if self.trailing_gates_pass(ctx) {
                    if let Some(action) = self.trail_action(ctx) {
                        actions.push(action);
                    }
                }
                // Gates failing pauses trailing; the SL stays where it is.
            }
            ExitState::Closed => {}
        }

        actions
    }

    fn trail_action(&self, ctx: &ExitContext) -> Option<ExitAction> {
        let atr = ctx.atr?;
        let mult = if ctx.quality_trend {
            self.trailing_distance_atr_mult * QUALITY_TRAIL_BONUS
        } else {
            self.trailing_distance_atr_mult
        };
        let candidate = ctx.price - self.side.sign() * mult * atr;
        self.improves_sl(candidate).then_some(ExitAction::MoveSl {
            to: candidate,
            note: "trail",
        })
    }

    /// Confirm a broker-applied action back into the rule.
    pub fn apply(&mut self, action: &ExitAction) {
        match action {
            ExitAction::MoveSl { to, note } => {
                match *note {
                    "vix_widen" => {
                        // The only move allowed to worsen the SL, and only
                        // while still in INIT.
                        if self.state == ExitState::Init {
                            self.current_sl = *to;
                            self.vix_widened = true;
                        }
                    }
                    "breakeven" => {
                        if self.state == ExitState::Init {
                            self.current_sl = *to;
                            self.transition(ExitState::BeArmed);
                        }
                    }
                    "trail" => {
                        if self.improves_sl(*to) {
                            self.current_sl = *to;
                            self.last_trailing_sl = Some(*to);
                            if self.state.rank() < ExitState::Trailing.rank() {
                                self.transition(ExitState::Trailing);
                            }
                        }
                    }
                    _ => {
                        // Protector-tightened SL and similar improvements.
                        if self.state == ExitState::Init || self.improves_sl(*to) {
                            self.current_sl = *to;
                        }
                    }
                }
                self.touch();
            }
            ExitAction::PartialClose { .. } => {
                if self.state == ExitState::BeArmed {
                    self.transition(ExitState::PartialTaken);
                }
                self.partial_taken = true;
                self.touch();
            }
        }
        self.consecutive_failures = 0;
        self.degraded = false;
    }

    /// True when the partial threshold is met but the position is too small
    /// to split. The manager logs this and marks the partial skipped.
    pub fn partial_blocked_by_volume(&self, ctx: &ExitContext) -> bool {
        self.state == ExitState::BeArmed
            && !self.partial_skipped
            && ctx.volume < MIN_PARTIAL_VOLUME
            && self.progress(ctx.price) >= self.effective_thresholds(ctx).1
    }

    /// Record the skipped partial (volume < 0.02) so trailing may follow
    /// directly from BE_ARMED.
    pub fn mark_partial_skipped(&mut self) {
        self.partial_skipped = true;
        self.touch();
    }

    pub fn mark_closed(&mut self) {
        self.transition(ExitState::Closed);
        self.touch();
    }

    /// Record a broker failure: the rule degrades and, at the threshold,
    /// quarantines.
    pub fn record_failure(&mut self) {
        self.degraded = true;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= QUARANTINE_THRESHOLD {
            self.quarantined = true;
        }
        self.touch();
    }

    fn transition(&mut self, next: ExitState) {
        debug_assert!(
            next.rank() > self.state.rank() || next == ExitState::Closed,
            "state regression {} -> {}",
            self.state,
            next
        );
        if next.rank() > self.state.rank() {
            debug!(
                ticket = self.ticket,
                from = %self.state,
                to = %next,
                "exit rule transition"
            );
            self.state = next;
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// The gold scenario used throughout: BUY @ 2450, SL 2446, TP 2458.
    fn gold_rule() -> ExitRule {
        ExitRule::new(
            1, "XAUUSD", Side::Buy, 2450.0, 2446.0, 2458.0,
            0.25, 0.50, 0.50, true, 1.5, 20.0,
        )
    }

    fn calm_ctx(price: f64) -> ExitContext {
        ExitContext {
            price,
            atr: Some(3.5),
            squeeze: false,
            vix: Some(15.0),
            mtf_alignment: 3,
            ema200_stretch_atr: Some(0.8),
            vwap_zone: Some(VwapZone::Inside),
            hvn_distance: Some(2.0),
            fake_momentum: false,
            quality_trend: false,
            safety_tick: 0.0,
            volume: 0.02,
        }
    }

    #[test]
    fn breakeven_arms_at_quarter_progress() {
        let mut rule = gold_rule();
        // R = (2452 - 2450) / 8 = 0.25.
        let actions = rule.plan(&calm_ctx(2452.0));
        assert_eq!(
            actions,
            vec![ExitAction::MoveSl {
                to: 2450.0,
                note: "breakeven"
            }]
        );
        rule.apply(&actions[0]);
        assert_eq!(rule.state, ExitState::BeArmed);
        assert_eq!(rule.current_sl, 2450.0);
    }

    #[test]
    fn no_breakeven_below_threshold() {
        let rule = gold_rule();
        // R = 1/8 = 0.125 < 0.25.
        assert!(rule.plan(&calm_ctx(2451.0)).is_empty());
    }

    #[test]
    fn partial_fires_at_half_progress() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });

        // R = 4/8 = 0.5; volume is fine.
        let mut ctx = calm_ctx(2454.0);
        ctx.volume = 0.04;
        let actions = rule.plan(&ctx);
        assert_eq!(actions, vec![ExitAction::PartialClose { volume: 0.02 }]);
        rule.apply(&actions[0]);
        assert_eq!(rule.state, ExitState::PartialTaken);
    }

    #[test]
    fn partial_skipped_for_dust_volume() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        rule.mark_partial_skipped();

        // R = 0.5 but volume below the floor: no partial planned.
        let mut ctx = calm_ctx(2454.0);
        ctx.volume = 0.01;
        let actions = rule.plan(&ctx);
        assert!(actions.iter().all(|a| !matches!(a, ExitAction::PartialClose { .. })));
        assert_eq!(rule.state, ExitState::BeArmed);
    }

    #[test]
    fn dust_volume_trails_directly_from_be_armed() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        rule.mark_partial_skipped();

        // R = 5.6/8 = 0.7 >= 0.6 fallback; all gates green.
        let mut ctx = calm_ctx(2455.6);
        ctx.volume = 0.01;
        let actions = rule.plan(&ctx);
        assert_eq!(actions.len(), 1);
        let ExitAction::MoveSl { to, note } = &actions[0] else {
            panic!("expected a trailing move");
        };
        assert_eq!(*note, "trail");
        // 2455.6 - 1.5 * 3.5 = 2450.35
        assert!((to - 2450.35).abs() < 1e-9);

        rule.apply(&actions[0]);
        assert_eq!(rule.state, ExitState::Trailing);
        assert_eq!(rule.last_trailing_sl, Some(2450.35));
    }

    #[test]
    fn gate_failure_pauses_but_never_reverts() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        let mut ctx = calm_ctx(2455.6);
        ctx.volume = 0.04;
        rule.apply(&ExitAction::PartialClose { volume: 0.02 });
        let actions = rule.plan(&ctx);
        rule.apply(&actions[0]);
        let sl_before = rule.current_sl;

        // Gates flip: squeeze starts. Trailing must pause, SL untouched.
        let mut paused = calm_ctx(2456.5);
        paused.squeeze = true;
        assert!(rule.plan(&paused).is_empty());
        assert_eq!(rule.current_sl, sl_before);

        // Gates recover with a lower price: the candidate would worsen the
        // SL, so still no action.
        let lower = calm_ctx(2451.0);
        assert!(rule.plan(&lower).is_empty());
        assert_eq!(rule.current_sl, sl_before);
    }

    #[test]
    fn sl_monotone_after_be() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        // A hostile worsening move must be ignored.
        rule.apply(&ExitAction::MoveSl {
            to: 2444.0,
            note: "tighten",
        });
        assert_eq!(rule.current_sl, 2450.0);
    }

    #[test]
    fn vix_widen_only_before_be() {
        let mut rule = gold_rule();
        let mut ctx = calm_ctx(2450.5);
        ctx.vix = Some(25.0);

        let actions = rule.plan(&ctx);
        assert!(actions.iter().any(|a| matches!(
            a,
            ExitAction::MoveSl { note: "vix_widen", .. }
        )));
        // Widened SL sits further away: 2446 - 0.5 * 3.5 = 2444.25.
        let ExitAction::MoveSl { to, .. } = &actions[0] else {
            panic!()
        };
        assert!((to - 2444.25).abs() < 1e-9);
        rule.apply(&actions[0]);
        assert!(rule.vix_widened);

        // Once BE armed, a VIX spike plans no widening.
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        let mut after = calm_ctx(2452.5);
        after.vix = Some(30.0);
        let actions = rule.plan(&after);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, ExitAction::MoveSl { note: "vix_widen", .. })));
    }

    #[test]
    fn stretched_tape_tightens_thresholds() {
        let rule = gold_rule();
        let mut ctx = calm_ctx(2451.5);
        ctx.vwap_zone = Some(VwapZone::Outer);
        // R = 1.5/8 = 0.1875 >= 0.25 * 0.7 = 0.175: BE arms early.
        let actions = rule.plan(&ctx);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ExitAction::MoveSl { note: "breakeven", .. })));
    }

    #[test]
    fn quality_trend_widens_trailing_distance() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        rule.apply(&ExitAction::PartialClose { volume: 0.01 });

        let mut ctx = calm_ctx(2456.0);
        ctx.quality_trend = true;
        let actions = rule.plan(&ctx);
        let ExitAction::MoveSl { to, .. } = &actions[0] else {
            panic!("expected trail");
        };
        // 2456 - 1.5 * 1.25 * 3.5 = 2449.4375 — wider than the plain trail.
        assert!((to - 2449.4375).abs() < 1e-9);
    }

    #[test]
    fn unavailable_stretch_fails_gate() {
        let mut rule = gold_rule();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        rule.apply(&ExitAction::PartialClose { volume: 0.01 });

        let mut ctx = calm_ctx(2456.0);
        ctx.ema200_stretch_atr = None;
        assert!(!rule.trailing_gates_pass(&ctx));
    }

    #[test]
    fn failures_degrade_then_quarantine() {
        let mut rule = gold_rule();
        rule.record_failure();
        assert!(rule.degraded);
        assert!(!rule.quarantined);
        rule.record_failure();
        rule.record_failure();
        assert!(rule.quarantined);
        // A quarantined rule plans nothing.
        assert!(rule.plan(&calm_ctx(2454.0)).is_empty());
    }

    #[test]
    fn success_clears_degradation() {
        let mut rule = gold_rule();
        rule.record_failure();
        rule.apply(&ExitAction::MoveSl {
            to: 2450.0,
            note: "breakeven",
        });
        assert!(!rule.degraded);
        assert_eq!(rule.consecutive_failures, 0);
    }

    #[test]
    fn state_order_is_monotone() {
        assert!(ExitState::Init.rank() < ExitState::BeArmed.rank());
        assert!(ExitState::BeArmed.rank() < ExitState::PartialTaken.rank());
        assert!(ExitState::PartialTaken.rank() < ExitState::Trailing.rank());
        assert!(ExitState::Trailing.rank() < ExitState::Closed.rank());
    }

    #[test]
    fn closed_is_terminal() {
        let mut rule = gold_rule();
        rule.mark_closed();
        assert_eq!(rule.state, ExitState::Closed);
        assert!(rule.plan(&calm_ctx(2454.0)).is_empty());
    }

    #[test]
    fn short_side_mirrors() {
        let mut rule = ExitRule::new(
            2, "XAUUSD", Side::Sell, 2450.0, 2454.0, 2442.0,
            0.25, 0.50, 0.50, true, 1.5, 20.0,
        );
        // R = (2450 - 2448) / 8 = 0.25.
        let actions = rule.plan(&calm_ctx(2448.0));
        assert_eq!(
            actions,
            vec![ExitAction::MoveSl {
                to: 2450.0,
                note: "breakeven"
            }]
        );
        rule.apply(&actions[0]);

        // SL improvement for a short means moving DOWN.
        assert!(rule.improves_sl(2449.0));
        assert!(!rule.improves_sl(2451.0));
    }

    #[test]
    fn thresholds_clamped_to_bands() {
        let rule = ExitRule::new(
            3, "EURUSD", Side::Buy, 1.1, 1.09, 1.12,
            0.10, 0.90, 0.50, true, 1.5, 20.0,
        );
        assert!((rule.breakeven_pct - 0.20).abs() < f64::EPSILON);
        assert!((rule.partial_pct - 0.60).abs() < f64::EPSILON);
    }
}
