// =============================================================================
// Decision Path — regime → template → validation → order queue
// =============================================================================
//
// Runs synchronously inside each symbol's ingestion task, on every published
// snapshot. Candidates come from the advisor inbox; the engine never invents
// entries on its own. The path never awaits I/O: accepted orders go to the
// bounded order queue with a try-send.
//
// Stale snapshots put the symbol into exits-only mode: queued candidates are
// skipped with `stale_data` while the exit manager and protector keep
// working the open book.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broker::gateway::OrderCommand;
use crate::decision::{Decision, SkipReason};
use crate::events::{EventRecord, Severity};
use crate::market_data::{Snapshot, Timeframe};
use crate::regime::{classify_raw, RegimeReading, RegimeTracker};
use crate::session::{session_of_ms, SessionTag};
use crate::templates;
use crate::types::TradingMode;
use crate::validator::{validate, ValidationContext};

/// Volume on the breakout bar must exceed this multiple of the recent
/// average to confirm an Asia-session breakout.
const ASIA_VOLUME_CONFIRM_MULT: f64 = 1.5;

/// Process one snapshot for its symbol.
pub fn evaluate_snapshot(state: &Arc<AppState>, snapshot: &Snapshot) {
    let started = Instant::now();

    // Regime tracking runs on every snapshot, trade or not.
    let raw = classify_raw(snapshot);
    let confirmed = {
        let mut regimes = state.regimes.write();
        regimes
            .entry(snapshot.symbol.clone())
            .or_insert_with(RegimeTracker::new)
            .update(raw)
    };
    publish_regime_reading(state, snapshot, raw, confirmed);

    let proposals = state.drain_proposals(&snapshot.symbol);
    if proposals.is_empty() {
        state.latency.record("decision", started.elapsed());
        return;
    }

    let session = session_of_ms(snapshot.as_of_ms);
    let trading_mode = state.runtime_config.read().trading_mode;

    for candidate in proposals {
        let decision = decide_candidate(state, snapshot, &candidate, confirmed, session);

        let emitted = decision.trade_spec.clone();
        info!(
            symbol = %snapshot.symbol,
            status = %decision.status,
            score = decision.validation_score,
            reasons = ?decision.skip_tags(),
            "candidate decided"
        );
        state.events.publish(
            EventRecord::context("decision", "candidate_decided")
                .with_symbol(snapshot.symbol.clone())
                .with_payload(serde_json::json!({
                    "status": decision.status.to_string(),
                    "skip_reasons": decision.skip_tags(),
                    "template": decision.template,
                    "score": decision.validation_score,
                })),
        );
        state.push_decision(decision);

        let Some(spec) = emitted else { continue };

        if trading_mode != TradingMode::Live {
            debug!(
                symbol = %snapshot.symbol,
                mode = %trading_mode,
                "decision emitted but engine not live — order withheld"
            );
            continue;
        }

        // Bounded try-send: the hot path never blocks on the broker.
        if let Err(e) = state.order_tx.try_send(OrderCommand::Place(spec)) {
            warn!(symbol = %snapshot.symbol, error = %e, "order queue full — entry dropped");
            state.push_error("order queue full — entry dropped", None);
            state.events.publish(
                EventRecord::action("decision", "order_queue_full")
                    .with_symbol(snapshot.symbol.clone())
                    .with_severity(Severity::Critical),
            );
        }
    }

    state.latency.record("decision", started.elapsed());
}

/// Validate one advisor candidate against the current snapshot.
fn decide_candidate(
    state: &Arc<AppState>,
    snapshot: &Snapshot,
    candidate: &crate::decision::TradeSpec,
    confirmed: RegimeReading,
    session: SessionTag,
) -> Decision {
    let regime_str = confirmed.regime.to_string();
    let session_str = session.to_string();

    if snapshot.stale {
        return Decision::skipped(
            vec![SkipReason::StaleData],
            None,
            &session_str,
            &regime_str,
        );
    }

    let Some(m15) = snapshot.features(Timeframe::M15) else {
        return Decision::skipped(
            vec![SkipReason::MissingRequiredFeature("m15_frame".into())],
            None,
            &session_str,
            &regime_str,
        );
    };

    let template = match templates::route(confirmed.regime, session, m15) {
        Ok(template) => template,
        Err(reason) => {
            return Decision::skipped(vec![reason], None, &session_str, &regime_str);
        }
    };

    let live_price = snapshot.last_price.unwrap_or(candidate.entry);
    let ctx = ValidationContext {
        template,
        session,
        regime: confirmed.regime,
        news_blackout: state
            .news
            .is_blackout(&snapshot.symbol, snapshot.as_of_ms),
        live_price,
        spread: snapshot.spread.unwrap_or(0.0),
        slippage_estimate: 0.0,
        atr_h1: snapshot.atr(Timeframe::H1),
        asia_volume_confirmed: asia_volume_confirmed(snapshot),
    };

    validate(candidate, &ctx)
}

/// Breakout-bar volume versus the trailing M5 average.
fn asia_volume_confirmed(snapshot: &Snapshot) -> bool {
    let Some(frame) = snapshot.frame(Timeframe::M5) else {
        return false;
    };
    let candles = &frame.candles;
    if candles.len() < 21 {
        return false;
    }
    let last = &candles[candles.len() - 1];
    let baseline: f64 = candles[candles.len() - 21..candles.len() - 1]
        .iter()
        .map(|c| c.volume)
        .sum::<f64>()
        / 20.0;
    baseline > 0.0 && last.volume >= ASIA_VOLUME_CONFIRM_MULT * baseline
}

fn publish_regime_reading(
    state: &Arc<AppState>,
    snapshot: &Snapshot,
    raw: RegimeReading,
    confirmed: RegimeReading,
) {
    if raw.regime != confirmed.regime {
        debug!(
            symbol = %snapshot.symbol,
            raw = %raw.regime,
            held = %confirmed.regime,
            "regime reading held by persistence filter"
        );
    }
    state.events.publish(
        EventRecord::context("regime", "classified")
            .with_symbol(snapshot.symbol.clone())
            .with_payload(serde_json::json!({
                "raw": raw.regime.to_string(),
                "confirmed": confirmed.regime.to_string(),
                "confidence": confirmed.confidence,
            })),
    );
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::decision::{DecisionStatus, TradeSpec};
    use crate::events;
    use crate::indicators::features::AdxSummary;
    use crate::indicators::Features;
    use crate::latency::LatencyTracker;
    use crate::market_data::order_flow::OrderFlowTracker;
    use crate::market_data::{FrameView, MarketRings, SnapshotHub};
    use crate::runtime_config::EngineConfig;
    use crate::session::NewsCalendar;
    use crate::types::{OrderKind, Side};
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn test_state(order_capacity: usize) -> (Arc<AppState>, mpsc::Receiver<OrderCommand>) {
        let (bus, _rx) = events::channel(64);
        let (order_tx, order_rx) = mpsc::channel(order_capacity);
        let mut config = EngineConfig::default();
        config.trading_mode = crate::types::TradingMode::Live;
        let state = AppState::new(
            Arc::new(RwLock::new(config)),
            Arc::new(MarketRings::new(100, 100)),
            Arc::new(SnapshotHub::new()),
            Arc::new(OrderFlowTracker::new()),
            Arc::new(NewsCalendar::new()),
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(Vec::new())),
            bus,
            Arc::new(LatencyTracker::new()),
            order_tx,
        );
        (Arc::new(state), order_rx)
    }

    fn trend_features() -> Features {
        let mut f = Features::unavailable();
        f.adx = Some(AdxSummary {
            adx: 32.0,
            di_plus: 28.0,
            di_minus: 10.0,
        });
        f.ema_aligned = Some(true);
        f.ema200 = Some(2400.0);
        f.atr14 = Some(3.5);
        f.last_close = Some(2449.0);
        f
    }

    /// NY-session snapshot in a confirmed-strong trend shape.
    fn trend_snapshot() -> Snapshot {
        // 2026-03-02 17:00 UTC → NY session.
        let as_of_ms = 1_772_470_800_000_i64;
        let mut frames = HashMap::new();
        for tf in [Timeframe::M5, Timeframe::M15, Timeframe::H1] {
            frames.insert(
                tf,
                FrameView {
                    candles: Vec::new(),
                    open_candle: None,
                    features: trend_features(),
                    fresh: true,
                },
            );
        }
        Snapshot {
            snapshot_id: 1,
            symbol: "XAUUSD".into(),
            as_of_ms,
            stale: false,
            last_price: Some(2449.0),
            spread: Some(0.5),
            frames,
        }
    }

    fn gold_buy_stop() -> TradeSpec {
        TradeSpec {
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            order_type: OrderKind::Stop,
            entry: 2450.0,
            sl: 2446.0,
            tp: 2458.0,
            volume: Some(0.02),
            template_name: None,
            template_version: None,
            confidence: None,
            tags: Vec::new(),
        }
    }

    fn confirm_trend(state: &Arc<AppState>, snapshot: &Snapshot) {
        // Prime the tracker: TREND needs hold + streak to confirm.
        for _ in 0..8 {
            evaluate_snapshot(state, snapshot);
        }
    }

    #[test]
    fn strong_trend_candidate_reaches_order_queue() {
        let (state, mut order_rx) = test_state(8);
        let snapshot = trend_snapshot();
        confirm_trend(&state, &snapshot);

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        let decisions = state.recent_decisions.read();
        let last = decisions.last().unwrap();
        assert_eq!(last.status, DecisionStatus::Emitted);
        assert_eq!(last.template.as_deref(), Some("trend_pullback_v2"));
        assert!(last.validation_score >= 60);
        assert!(last.decision_tags.contains(&"session=NY".to_string()));
        drop(decisions);

        match order_rx.try_recv() {
            Ok(OrderCommand::Place(spec)) => assert_eq!(spec.symbol, "XAUUSD"),
            other => panic!("expected queued order, got {other:?}"),
        }
    }

    #[test]
    fn news_blackout_produces_news_block_skip() {
        let (state, mut order_rx) = test_state(8);
        let snapshot = trend_snapshot();
        confirm_trend(&state, &snapshot);

        state.news.add(crate::session::NewsWindow {
            label: "NFP".into(),
            symbol: None,
            start_ms: snapshot.as_of_ms - 1_000,
            end_ms: snapshot.as_of_ms + 600_000,
        });

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        let decisions = state.recent_decisions.read();
        let last = decisions.last().unwrap();
        assert_eq!(last.status, DecisionStatus::Skipped);
        assert_eq!(last.skip_tags(), vec!["news_block".to_string()]);
        drop(decisions);
        assert!(order_rx.try_recv().is_err());
    }

    #[test]
    fn stale_snapshot_refuses_new_entries() {
        let (state, mut order_rx) = test_state(8);
        let mut snapshot = trend_snapshot();
        confirm_trend(&state, &snapshot);
        snapshot.stale = true;

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        let decisions = state.recent_decisions.read();
        let last = decisions.last().unwrap();
        assert_eq!(last.status, DecisionStatus::Skipped);
        assert_eq!(last.skip_tags(), vec!["stale_data".to_string()]);
        drop(decisions);
        assert!(order_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_regime_skips_with_no_template() {
        let (state, _order_rx) = test_state(8);
        let mut snapshot = trend_snapshot();
        // Strip the trend evidence: raw classification falls to UNKNOWN.
        for frame in snapshot.frames.values_mut() {
            frame.features = Features::unavailable();
        }

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        let decisions = state.recent_decisions.read();
        let last = decisions.last().unwrap();
        assert_eq!(last.status, DecisionStatus::Skipped);
        assert_eq!(last.skip_tags(), vec!["no_template_for_regime".to_string()]);
    }

    #[test]
    fn paused_mode_withholds_orders() {
        let (state, mut order_rx) = test_state(8);
        let snapshot = trend_snapshot();
        confirm_trend(&state, &snapshot);
        state.runtime_config.write().trading_mode = crate::types::TradingMode::Paused;

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        // Decision recorded, order withheld.
        let decisions = state.recent_decisions.read();
        assert_eq!(decisions.last().unwrap().status, DecisionStatus::Emitted);
        drop(decisions);
        assert!(order_rx.try_recv().is_err());
    }

    #[test]
    fn validator_idempotent_through_pipeline() {
        let (state, _rx) = test_state(8);
        let snapshot = trend_snapshot();
        confirm_trend(&state, &snapshot);

        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);
        state.push_proposal(gold_buy_stop());
        evaluate_snapshot(&state, &snapshot);

        let decisions = state.recent_decisions.read();
        let n = decisions.len();
        let a = &decisions[n - 2];
        let b = &decisions[n - 1];
        assert_eq!(a.status, b.status);
        assert_eq!(a.validation_score, b.validation_score);
        assert_eq!(a.decision_tags, b.decision_tags);
    }
}
