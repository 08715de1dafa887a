// =============================================================================
// Trade Validator — layered checks over an untrusted candidate
// =============================================================================
//
// Check order: schema → geometry → cost → reward/risk → session/news.
// The first failing layer produces the skip; later layers are not evaluated.
//
// One auto-repair attempt is permitted:
//   - a missing confidence defaults to the template's median (not a failure);
//   - an SL tighter than the 0.4 x ATR(H1) floor is widened to the floor and
//     the candidate re-validated once.
//
// Validation is a pure function of (spec, context): running it twice yields
// the same decision.
// =============================================================================

use tracing::debug;

use crate::decision::{Decision, SkipReason, TradeSpec};
use crate::regime::Regime;
use crate::session::SessionTag;
use crate::templates::Template;
use crate::types::{OrderKind, Side};

/// SL floor as a multiple of ATR(H1).
const SL_ATR_FLOOR: f64 = 0.4;

/// Maximum (spread + slippage) / reward ratio.
const COST_CAP: f64 = 0.20;

/// Everything the validator needs besides the candidate itself.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub template: &'static Template,
    pub session: SessionTag,
    pub regime: Regime,
    pub news_blackout: bool,
    /// Live mid price at validation time.
    pub live_price: f64,
    pub spread: f64,
    pub slippage_estimate: f64,
    pub atr_h1: Option<f64>,
    /// Volume confirmation for Asia-session breakouts.
    pub asia_volume_confirmed: bool,
}

/// Validate a candidate and produce the final decision.
pub fn validate(candidate: &TradeSpec, ctx: &ValidationContext) -> Decision {
    let session = ctx.session.to_string();
    let regime = ctx.regime.to_string();

    // Default a missing confidence before anything else; this is the benign
    // half of the auto-repair budget.
    let mut spec = candidate.clone();
    let mut repair_tags = Vec::new();
    if spec.confidence.is_none() {
        spec.confidence = Some(ctx.template.median_confidence);
        repair_tags.push("repaired=confidence_defaulted".to_string());
    }
    spec.template_name = Some(ctx.template.name.to_string());
    spec.template_version = Some(ctx.template.version.to_string());

    match run_layers(&spec, ctx) {
        Ok(()) => {}
        Err(SkipReason::GeometryInvalid(detail)) if detail == "sl_below_atr_floor" => {
            // Second half of the repair budget: widen the SL to the floor and
            // re-validate exactly once.
            match widen_sl_to_floor(&spec, ctx) {
                Some(widened) => match run_layers(&widened, ctx) {
                    Ok(()) => {
                        debug!(symbol = %widened.symbol, "candidate repaired: sl widened to atr floor");
                        spec = widened;
                        repair_tags.push("repaired=sl_widened".to_string());
                    }
                    Err(reason) => {
                        return Decision::skipped(
                            vec![reason],
                            Some(ctx.template.name),
                            &session,
                            &regime,
                        );
                    }
                },
                None => {
                    return Decision::skipped(
                        vec![SkipReason::GeometryInvalid(detail)],
                        Some(ctx.template.name),
                        &session,
                        &regime,
                    );
                }
            }
        }
        Err(reason) => {
            return Decision::skipped(vec![reason], Some(ctx.template.name), &session, &regime);
        }
    }

    let score = validation_score(&spec, ctx);
    Decision::emitted(spec, ctx.template.name, &session, &regime, score, repair_tags)
}

fn run_layers(spec: &TradeSpec, ctx: &ValidationContext) -> Result<(), SkipReason> {
    check_schema(spec)?;
    check_geometry(spec, ctx)?;
    check_cost(spec, ctx)?;
    check_rr(spec, ctx)?;
    check_session_news(spec, ctx)?;
    Ok(())
}

// --- Layer 1: schema ---------------------------------------------------------

fn check_schema(spec: &TradeSpec) -> Result<(), SkipReason> {
    if spec.symbol.trim().is_empty() {
        return Err(SkipReason::SchemaInvalid("empty_symbol".into()));
    }
    for (name, value) in [("entry", spec.entry), ("sl", spec.sl), ("tp", spec.tp)] {
        if !value.is_finite() || value <= 0.0 {
            return Err(SkipReason::SchemaInvalid(format!("bad_{name}")));
        }
    }
    if let Some(v) = spec.volume {
        if !v.is_finite() || v <= 0.0 {
            return Err(SkipReason::SchemaInvalid("bad_volume".into()));
        }
    }
    if let Some(c) = spec.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(SkipReason::SchemaInvalid("bad_confidence".into()));
        }
    }
    Ok(())
}

// --- Layer 2: geometry -------------------------------------------------------

fn check_geometry(spec: &TradeSpec, ctx: &ValidationContext) -> Result<(), SkipReason> {
    // Market orders are judged against the live price; pending orders
    // against their own entry.
    let reference = match spec.order_type {
        OrderKind::Market => ctx.live_price,
        _ => spec.entry,
    };

    let sides_ok = match spec.side {
        Side::Buy => spec.sl < reference && reference < spec.tp,
        Side::Sell => spec.sl > reference && reference > spec.tp,
    };
    if !sides_ok {
        let detail = match spec.side {
            Side::Buy if spec.sl >= reference => "sl_wrong_side",
            Side::Sell if spec.sl <= reference => "sl_wrong_side",
            _ => "tp_wrong_side",
        };
        return Err(SkipReason::GeometryInvalid(detail.into()));
    }

    // Pending entries must sit on the correct side of the live price.
    match spec.order_type {
        OrderKind::Stop => {
            let beyond = match spec.side {
                Side::Buy => spec.entry > ctx.live_price,
                Side::Sell => spec.entry < ctx.live_price,
            };
            if !beyond {
                return Err(SkipReason::GeometryInvalid("stop_not_beyond_price".into()));
            }
        }
        OrderKind::Limit => {
            let pullback = match spec.side {
                Side::Buy => spec.entry < ctx.live_price,
                Side::Sell => spec.entry > ctx.live_price,
            };
            if !pullback {
                return Err(SkipReason::GeometryInvalid("limit_not_a_pullback".into()));
            }
        }
        OrderKind::Market => {}
    }

    // SL distance floor in ATR terms. The small tolerance keeps a just-
    // widened SL from re-tripping the floor on rounding noise.
    let atr = ctx
        .atr_h1
        .ok_or_else(|| SkipReason::MissingRequiredFeature("atr_14".into()))?;
    if (reference - spec.sl).abs() + 1e-9 < SL_ATR_FLOOR * atr {
        return Err(SkipReason::GeometryInvalid("sl_below_atr_floor".into()));
    }

    Ok(())
}

/// Build the repaired candidate with its SL widened to the ATR floor.
fn widen_sl_to_floor(spec: &TradeSpec, ctx: &ValidationContext) -> Option<TradeSpec> {
    let atr = ctx.atr_h1?;
    let reference = match spec.order_type {
        OrderKind::Market => ctx.live_price,
        _ => spec.entry,
    };
    let mut widened = spec.clone();
    widened.sl = match spec.side {
        Side::Buy => reference - SL_ATR_FLOOR * atr,
        Side::Sell => reference + SL_ATR_FLOOR * atr,
    };
    Some(widened)
}

// --- Layer 3: cost gate ------------------------------------------------------

fn check_cost(spec: &TradeSpec, ctx: &ValidationContext) -> Result<(), SkipReason> {
    let reward = spec.reward_distance();
    if reward <= f64::EPSILON {
        return Err(SkipReason::CostGateFailed);
    }
    let cost_ratio = (ctx.spread + ctx.slippage_estimate) / reward;
    if cost_ratio > COST_CAP {
        // Single message only; the ratio itself goes to the event payload.
        return Err(SkipReason::CostGateFailed);
    }
    Ok(())
}

// --- Layer 4: reward/risk bounds ---------------------------------------------

fn check_rr(spec: &TradeSpec, ctx: &ValidationContext) -> Result<(), SkipReason> {
    let rr = spec.rr().ok_or(SkipReason::RrOutOfBounds)?;
    let (lo, hi) = ctx.template.rr_bounds;
    if rr < lo || rr > hi {
        return Err(SkipReason::RrOutOfBounds);
    }
    Ok(())
}

// --- Layer 5: session & news -------------------------------------------------

fn check_session_news(spec: &TradeSpec, ctx: &ValidationContext) -> Result<(), SkipReason> {
    if ctx.news_blackout {
        return Err(SkipReason::NewsBlock);
    }
    // Asia breakouts need volume confirmation; the thin book produces false
    // breaks otherwise.
    if ctx.session == SessionTag::Asia
        && ctx.template.name == "breakout_v2"
        && !ctx.asia_volume_confirmed
    {
        return Err(SkipReason::VolumeUnconfirmed);
    }
    let _ = spec;
    Ok(())
}

// --- Scoring -----------------------------------------------------------------

/// Score an accepted candidate in [0, 100].
fn validation_score(spec: &TradeSpec, ctx: &ValidationContext) -> i32 {
    let mut score = 50.0;
    score += spec.confidence.unwrap_or(0.0) * 20.0;

    if let Some(atr) = ctx.atr_h1 {
        let sl_atr = spec.risk_distance() / atr;
        if sl_atr >= 0.5 {
            score += 2.0;
        } else if sl_atr >= SL_ATR_FLOOR {
            // Legal but fragile.
            score -= 2.0;
        }
    }

    let reward = spec.reward_distance();
    if reward > f64::EPSILON {
        let cost_ratio = (ctx.spread + ctx.slippage_estimate) / reward;
        if cost_ratio < 0.10 {
            score += 2.0;
        }
    }

    if spec.rr().map(|rr| rr > 5.0).unwrap_or(false) {
        score -= 5.0;
    }

    (score.round() as i32).clamp(0, 100)
}
