// =============================================================================
// Exit Manager Loop — periodic evaluation of every open position's rule
// =============================================================================
//
// Runs as a background task on a ~30 s cadence:
//
//   1. Refresh the read-only position mirror from the broker.
//   2. Retire rules whose position is gone (CLOSED), attach rules to new
//      positions when auto-enable is on.
//   3. Build each rule's market context from the latest snapshot.
//   4. Plan → execute → confirm. A broker failure degrades the rule and is
//      retried next cycle; three consecutive failures quarantine it.
//   5. Persist the rule set on every state change.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::broker::gateway::OrderGateway;
use crate::broker::{BrokerGateway, Position};
use crate::events::{EventBus, EventRecord, Severity};
use crate::indicators::Features;
use crate::market_data::{Snapshot, SnapshotHub, Timeframe};
use crate::persist::{self, JsonStore};
use crate::runtime_config::EngineConfig;
use crate::types::Side;

use super::rule::{ExitAction, ExitContext, ExitRule, ExitState};

/// Evaluation cadence.
const CYCLE: Duration = Duration::from_secs(30);

pub struct ExitManager {
    broker: Arc<dyn BrokerGateway>,
    gateway: Arc<OrderGateway>,
    hub: Arc<SnapshotHub>,
    config: Arc<RwLock<EngineConfig>>,
    events: EventBus,
    store: JsonStore<ExitRule>,
    rules: RwLock<HashMap<u64, ExitRule>>,
    /// Shared read-only mirror of broker positions, refreshed each cycle.
    positions_mirror: Arc<RwLock<Vec<Position>>>,
    /// External volatility-index reading pushed through the API.
    vix: Arc<RwLock<Option<f64>>>,
    safety_ticks: RwLock<HashMap<String, f64>>,
}

impl ExitManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        gateway: Arc<OrderGateway>,
        hub: Arc<SnapshotHub>,
        config: Arc<RwLock<EngineConfig>>,
        events: EventBus,
        store: JsonStore<ExitRule>,
        positions_mirror: Arc<RwLock<Vec<Position>>>,
        vix: Arc<RwLock<Option<f64>>>,
    ) -> Self {
        let rules = persist::load_exit_rules(&store).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load exit rules — starting empty");
            HashMap::new()
        });
        if !rules.is_empty() {
            info!(count = rules.len(), "exit rules restored from store");
        }
        Self {
            broker,
            gateway,
            hub,
            config,
            events,
            store,
            rules: RwLock::new(rules),
            positions_mirror,
            vix,
            safety_ticks: RwLock::new(HashMap::new()),
        }
    }

    pub fn rules_snapshot(&self) -> Vec<ExitRule> {
        self.rules.read().values().cloned().collect()
    }

    /// Reconcile persisted rules against the live book once at startup.
    pub async fn reconcile_startup(&self) {
        let live = match self.broker.list_positions().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "startup reconcile: cannot list positions");
                return;
            }
        };
        let config = self.config.read().clone();
        let outcome = {
            let mut rules = self.rules.write();
            persist::reconcile_exit_rules(&mut rules, &live, &config)
        };
        if !outcome.retired.is_empty() || !outcome.adopted.is_empty() {
            self.events.publish(
                EventRecord::action("exit", "startup_reconciled").with_payload(serde_json::json!({
                    "retired": outcome.retired,
                    "adopted": outcome.adopted,
                })),
            );
            self.persist();
        }
        *self.positions_mirror.write() = live;
    }

    /// Run the manager loop forever.
    pub async fn run(self: Arc<Self>) {
        info!(cycle_secs = CYCLE.as_secs(), "exit manager started");
        let mut ticker = interval(CYCLE);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    /// One full evaluation cycle. Public for tests.
    pub async fn cycle(&self) {
        let live = match self.broker.list_positions().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "exit cycle: cannot list positions — skipping");
                return;
            }
        };
        *self.positions_mirror.write() = live.clone();

        self.sync_rules(&live);

        let work: Vec<(u64, Position)> = {
            let rules = self.rules.read();
            live.into_iter()
                .filter(|p| {
                    rules
                        .get(&p.ticket)
                        .map(|r| !r.quarantined && r.state != ExitState::Closed)
                        .unwrap_or(false)
                })
                .map(|p| (p.ticket, p))
                .collect()
        };

        for (ticket, position) in work {
            let Some(snapshot) = self.hub.latest(&position.symbol) else {
                debug!(ticket, symbol = %position.symbol, "no snapshot yet — skipping rule");
                continue;
            };
            let safety_tick = self.safety_tick(&position.symbol).await;
            let vix = *self.vix.read();

            let (actions, dust_partial) = {
                let rules = self.rules.read();
                let Some(rule) = rules.get(&ticket) else {
                    continue;
                };
                let ctx = build_context(rule, &snapshot, position.volume, vix, safety_tick);
                (rule.plan(&ctx), rule.partial_blocked_by_volume(&ctx))
            };

            if dust_partial {
                let mut rules = self.rules.write();
                if let Some(rule) = rules.get_mut(&ticket) {
                    rule.mark_partial_skipped();
                    info!(
                        ticket,
                        volume = position.volume,
                        "partial threshold met but volume too small — skipped"
                    );
                    self.events.publish(
                        EventRecord::action("exit", "partial_skipped")
                            .with_symbol(position.symbol.clone())
                            .with_ticket(ticket)
                            .with_payload(serde_json::json!({"volume": position.volume})),
                    );
                }
                drop(rules);
                self.persist();
            }

            for action in actions {
                self.execute(ticket, &position, &action).await;
            }
        }
    }

    /// Attach rules to fresh positions, close rules for vanished ones.
    fn sync_rules(&self, live: &[Position]) {
        let config = self.config.read().clone();
        let mut changed = false;
        let mut rules = self.rules.write();

        let live_tickets: std::collections::HashSet<u64> =
            live.iter().map(|p| p.ticket).collect();
        let gone: Vec<u64> = rules
            .keys()
            .copied()
            .filter(|t| !live_tickets.contains(t))
            .collect();
        for ticket in gone {
            if let Some(rule) = rules.get_mut(&ticket) {
                if rule.state != ExitState::Closed {
                    rule.mark_closed();
                    info!(ticket, "position gone — exit rule closed");
                    self.events.publish(
                        EventRecord::action("exit", "rule_closed")
                            .with_symbol(rule.symbol.clone())
                            .with_ticket(ticket),
                    );
                    changed = true;
                }
            }
            rules.remove(&ticket);
        }

        if config.auto_enable_exit_rules {
            for position in live {
                if rules.contains_key(&position.ticket) {
                    continue;
                }
                let ours = position.magic == config.magic;
                if !ours && !config.adopt_untracked_positions {
                    continue;
                }
                let (Some(sl), Some(tp)) = (position.sl, position.tp) else {
                    continue;
                };
                let rule = ExitRule::new(
                    position.ticket,
                    position.symbol.clone(),
                    position.side,
                    position.entry_price,
                    sl,
                    tp,
                    config.breakeven_pct,
                    config.partial_pct,
                    config.partial_close_fraction,
                    config.trailing_enabled,
                    config.trailing_distance_atr_mult,
                    config.vix_threshold,
                );
                info!(
                    ticket = position.ticket,
                    symbol = %position.symbol,
                    "exit rule attached to new position"
                );
                self.events.publish(
                    EventRecord::action("exit", "rule_created")
                        .with_symbol(position.symbol.clone())
                        .with_ticket(position.ticket),
                );
                rules.insert(position.ticket, rule);
                changed = true;
            }
        }

        drop(rules);
        if changed {
            self.persist();
        }
    }

    async fn execute(&self, ticket: u64, position: &Position, action: &ExitAction) {
        let retcode = match action {
            ExitAction::MoveSl { to, .. } => self.gateway.modify_sl(ticket, *to).await,
            ExitAction::PartialClose { volume } => {
                self.gateway
                    .close_position(ticket, Some(*volume), "partial take-profit")
                    .await
            }
        };

        let mut rules = self.rules.write();
        let Some(rule) = rules.get_mut(&ticket) else {
            return;
        };

        if retcode.is_ok() {
            let before = rule.state;
            rule.apply(action);
            let kind = match action {
                ExitAction::MoveSl { note, .. } => match *note {
                    "breakeven" => "breakeven_armed",
                    "trail" => "trailing_sl_moved",
                    "vix_widen" => "sl_widened_vix",
                    _ => "sl_moved",
                },
                ExitAction::PartialClose { .. } => "partial_taken",
            };
            info!(
                ticket,
                symbol = %position.symbol,
                kind,
                state = %rule.state,
                sl = rule.current_sl,
                "exit action applied"
            );
            self.events.publish(
                EventRecord::action("exit", kind)
                    .with_symbol(position.symbol.clone())
                    .with_ticket(ticket)
                    .with_payload(serde_json::json!({
                        "from_state": before.to_string(),
                        "to_state": rule.state.to_string(),
                        "sl": rule.current_sl,
                    })),
            );
            drop(rules);
            self.persist();
        } else {
            rule.record_failure();
            let quarantined = rule.quarantined;
            error!(
                ticket,
                retcode = %retcode,
                failures = rule.consecutive_failures,
                quarantined,
                "exit action failed — rule degraded"
            );
            self.events.publish(
                EventRecord::action("exit", if quarantined { "rule_quarantined" } else { "rule_degraded" })
                    .with_symbol(position.symbol.clone())
                    .with_ticket(ticket)
                    .with_payload(serde_json::json!({"retcode": retcode.to_string()}))
                    .with_severity(if quarantined {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    }),
            );
            drop(rules);
            self.persist();
        }
    }

    async fn safety_tick(&self, symbol: &str) -> f64 {
        if let Some(tick) = self.safety_ticks.read().get(symbol) {
            return *tick;
        }
        let tick = match self.broker.symbol_info(symbol).await {
            Ok(info) => info.point * 2.0,
            Err(_) => 0.0,
        };
        self.safety_ticks.write().insert(symbol.to_string(), tick);
        tick
    }

    fn persist(&self) {
        let rules = self.rules.read().clone();
        if let Err(e) = persist::save_exit_rules(&self.store, &rules) {
            warn!(error = %e, "failed to persist exit rules");
        }
    }
}

// =============================================================================
// Context construction
// =============================================================================

/// Build the rule's market context from the latest snapshot.
pub fn build_context(
    rule: &ExitRule,
    snapshot: &Snapshot,
    volume: f64,
    vix: Option<f64>,
    safety_tick: f64,
) -> ExitContext {
    let price = snapshot.last_price.unwrap_or(rule.entry);
    let m15 = snapshot.features(Timeframe::M15);
    let h1 = snapshot.features(Timeframe::H1);
    let m5 = snapshot.features(Timeframe::M5);

    let bullish = rule.side == Side::Buy;
    let mtf_alignment =
        snapshot.alignment_score(&[Timeframe::M5, Timeframe::M15, Timeframe::H1], bullish);

    ExitContext {
        price,
        atr: h1.and_then(|f| f.atr14).or_else(|| m15.and_then(|f| f.atr14)),
        squeeze: m15.map(is_squeeze).unwrap_or(false),
        vix,
        mtf_alignment,
        ema200_stretch_atr: h1.and_then(Features::ema200_stretch_atr),
        vwap_zone: m5.and_then(|f| f.vwap.map(|v| v.zone)),
        hvn_distance: m15
            .and_then(|f| f.hvn_price)
            .map(|hvn| (price - hvn).abs()),
        fake_momentum: m15.map(|f| is_fake_momentum(f, rule, price)).unwrap_or(false),
        quality_trend: h1.map(|f| is_quality_trend(f, rule.side)).unwrap_or(false),
        safety_tick,
        volume,
    }
}

/// Compression read: band width under half its trailing median.
fn is_squeeze(features: &Features) -> bool {
    match (features.bollinger, features.bb_width_median) {
        (Some(bb), Some(median)) if median > 0.0 => bb.width < 0.5 * median,
        _ => false,
    }
}

/// Price pushing in the trade direction while momentum readings disagree.
fn is_fake_momentum(features: &Features, rule: &ExitRule, price: f64) -> bool {
    if rule.progress(price) < 0.2 {
        return false;
    }
    let macd_against = features
        .macd
        .map(|m| m.histogram * rule.side.sign() < 0.0)
        .unwrap_or(false);
    let rsi_against = features
        .rsi14
        .map(|rsi| match rule.side {
            Side::Buy => rsi < 45.0,
            Side::Sell => rsi > 55.0,
        })
        .unwrap_or(false);
    macd_against && rsi_against
}

/// EMA50/200 slopes aligned with the trade and stretch in a normal band.
fn is_quality_trend(features: &Features, side: Side) -> bool {
    let slope_ok = match (features.ema50_slope, features.ema200_slope) {
        (Some(s50), Some(s200)) => s50 * side.sign() > 0.0 && s200 * side.sign() > 0.0,
        _ => false,
    };
    let stretch_ok = features
        .ema200_stretch_atr()
        .map(|s| s.abs() <= 2.0)
        .unwrap_or(false);
    slope_ok && stretch_ok
}
