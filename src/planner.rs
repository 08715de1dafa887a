// =============================================================================
// Auto-Execution Planner — conditional trade plans from the advisor
// =============================================================================
//
// A plan is a proposed order plus a list of conditions that must ALL hold on
// a live snapshot before the order is dispatched. The planner evaluates
// pending plans every ~30 s:
//
//   PENDING → TRIGGERED    all conditions true
//   TRIGGERED → EXECUTED   gateway placement succeeded
//   TRIGGERED → PENDING    transient placement failure (retried next cycle)
//   PENDING → EXPIRED      expires_at passed
//   PENDING → CANCELLED    operator action or hard rejection
//
// Plans persist on every state change and reload at startup.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::broker::gateway::{OrderGateway, SubmitOutcome};
use crate::decision::TradeSpec;
use crate::events::{EventBus, EventRecord, Severity};
use crate::indicators::patterns;
use crate::indicators::structure::{StructureEvent, StructureEventKind};
use crate::market_data::{Snapshot, SnapshotHub, Timeframe};
use crate::persist::JsonStore;
use crate::session::{session_of_ms, NewsCalendar, SessionTag};
use crate::types::{OrderKind, Side};

/// Evaluation cadence.
const CYCLE: Duration = Duration::from_secs(30);

/// Bars within which a structural event still counts for a condition.
const EVENT_FRESHNESS_BARS: usize = 5;

/// Structural direction as the advisor phrases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructDirection {
    Bull,
    Bear,
}

impl StructDirection {
    fn breaks_toward(self) -> Side {
        match self {
            Self::Bull => Side::Buy,
            Self::Bear => Side::Sell,
        }
    }
}

/// One trigger condition. ALL conditions of a plan must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    PriceAbove { level: f64 },
    PriceBelow { level: f64 },
    ChochDetected { direction: StructDirection },
    RejectionWick { direction: StructDirection },
    SessionIn { session: SessionTag },
    MinVolatility { atr_ratio: f64 },
    MaxVolatility { atr_ratio: f64 },
    TimeAfter { epoch_ms: i64 },
    TimeBefore { epoch_ms: i64 },
    NewsClear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Pending,
    Triggered,
    Executed,
    Cancelled,
    Expired,
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Triggered => write!(f, "TRIGGERED"),
            Self::Executed => write!(f, "EXECUTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A conditional trade plan authored by the advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub symbol: String,
    pub direction: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub volume: Option<f64>,
    #[serde(default = "default_order_type")]
    pub order_type: OrderKind,
    pub conditions: Vec<Condition>,
    pub expires_at: i64,
    pub state: PlanState,
    pub created_at: String,
    pub updated_at: String,
}

fn default_order_type() -> OrderKind {
    OrderKind::Market
}

impl Plan {
    pub fn to_trade_spec(&self) -> TradeSpec {
        TradeSpec {
            symbol: self.symbol.clone(),
            side: self.direction,
            order_type: self.order_type,
            entry: self.entry,
            sl: self.sl,
            tp: self.tp,
            volume: self.volume,
            template_name: Some("auto_plan".into()),
            template_version: None,
            confidence: None,
            tags: vec![format!("plan={}", self.plan_id)],
        }
    }
}

// =============================================================================
// Condition evaluation
// =============================================================================

/// Evaluate one condition against a live snapshot.
pub fn condition_met(
    condition: &Condition,
    snapshot: &Snapshot,
    news: &NewsCalendar,
    now_ms: i64,
) -> bool {
    match condition {
        Condition::PriceAbove { level } => snapshot
            .last_price
            .map(|p| p > *level)
            .unwrap_or(false),
        Condition::PriceBelow { level } => snapshot
            .last_price
            .map(|p| p < *level)
            .unwrap_or(false),
        Condition::ChochDetected { direction } => snapshot
            .features(Timeframe::M15)
            .map(|f| {
                matches!(
                    f.structure.event,
                    Some(StructureEvent {
                        kind: StructureEventKind::Choch,
                        direction: d,
                        bars_ago,
                    }) if d == direction.breaks_toward() && bars_ago <= EVENT_FRESHNESS_BARS
                )
            })
            .unwrap_or(false),
        Condition::RejectionWick { direction } => snapshot
            .frame(Timeframe::M15)
            .and_then(|f| patterns::rejection_wick(&f.candles))
            // A bull rejection is the market refusing lower prices.
            .map(|rejected| match direction {
                StructDirection::Bull => rejected == Side::Sell,
                StructDirection::Bear => rejected == Side::Buy,
            })
            .unwrap_or(false),
        Condition::SessionIn { session } => session_of_ms(now_ms) == *session,
        Condition::MinVolatility { atr_ratio } => snapshot
            .features(Timeframe::M5)
            .and_then(|f| f.atr_expansion)
            .map(|x| x >= *atr_ratio)
            .unwrap_or(false),
        Condition::MaxVolatility { atr_ratio } => snapshot
            .features(Timeframe::M5)
            .and_then(|f| f.atr_expansion)
            .map(|x| x <= *atr_ratio)
            .unwrap_or(false),
        Condition::TimeAfter { epoch_ms } => now_ms >= *epoch_ms,
        Condition::TimeBefore { epoch_ms } => now_ms < *epoch_ms,
        Condition::NewsClear => !news.is_blackout(&snapshot.symbol, now_ms),
    }
}

/// Do all of the plan's conditions hold?
pub fn all_conditions_met(
    plan: &Plan,
    snapshot: &Snapshot,
    news: &NewsCalendar,
    now_ms: i64,
) -> bool {
    plan.conditions
        .iter()
        .all(|c| condition_met(c, snapshot, news, now_ms))
}

// =============================================================================
// Plan engine
// =============================================================================

pub struct PlanEngine {
    gateway: Arc<OrderGateway>,
    hub: Arc<SnapshotHub>,
    news: Arc<NewsCalendar>,
    events: EventBus,
    store: JsonStore<Plan>,
    plans: RwLock<HashMap<String, Plan>>,
}

impl PlanEngine {
    pub fn new(
        gateway: Arc<OrderGateway>,
        hub: Arc<SnapshotHub>,
        news: Arc<NewsCalendar>,
        events: EventBus,
        store: JsonStore<Plan>,
    ) -> Self {
        let plans = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load plans — starting empty");
            HashMap::new()
        });
        if !plans.is_empty() {
            info!(count = plans.len(), "plans restored from store");
        }
        Self {
            gateway,
            hub,
            news,
            events,
            store,
            plans: RwLock::new(plans),
        }
    }

    /// Register a new advisor plan. The spec inside still passes validation
    /// at execution time via the gateway's own geometry checks.
    pub fn add(&self, mut plan: Plan) -> Plan {
        if plan.plan_id.is_empty() {
            plan.plan_id = uuid::Uuid::new_v4().to_string();
        }
        plan.state = PlanState::Pending;
        let now = chrono::Utc::now().to_rfc3339();
        plan.created_at = now.clone();
        plan.updated_at = now;

        info!(plan_id = %plan.plan_id, symbol = %plan.symbol, "plan registered");
        self.events.publish(
            EventRecord::action("planner", "plan_created")
                .with_symbol(plan.symbol.clone())
                .with_payload(serde_json::json!({
                    "plan_id": plan.plan_id,
                    "conditions": plan.conditions.len(),
                })),
        );
        self.plans
            .write()
            .insert(plan.plan_id.clone(), plan.clone());
        self.persist();
        plan
    }

    pub fn cancel(&self, plan_id: &str) -> bool {
        let mut plans = self.plans.write();
        let Some(plan) = plans.get_mut(plan_id) else {
            return false;
        };
        if plan.state != PlanState::Pending {
            return false;
        }
        plan.state = PlanState::Cancelled;
        plan.updated_at = chrono::Utc::now().to_rfc3339();
        drop(plans);
        self.persist();
        true
    }

    pub fn plans_snapshot(&self) -> Vec<Plan> {
        self.plans.read().values().cloned().collect()
    }

    pub async fn run(self: Arc<Self>) {
        info!(cycle_secs = CYCLE.as_secs(), "plan engine started");
        let mut ticker = interval(CYCLE);
        loop {
            ticker.tick().await;
            self.cycle(chrono::Utc::now().timestamp_millis()).await;
        }
    }

    /// One evaluation pass. Public for tests.
    pub async fn cycle(&self, now_ms: i64) {
        let pending: Vec<Plan> = self
            .plans
            .read()
            .values()
            .filter(|p| p.state == PlanState::Pending)
            .cloned()
            .collect();

        for plan in pending {
            if now_ms >= plan.expires_at {
                info!(plan_id = %plan.plan_id, "plan expired");
                self.transition(&plan.plan_id, PlanState::Expired);
                continue;
            }

            let Some(snapshot) = self.hub.latest(&plan.symbol) else {
                continue;
            };
            if snapshot.stale {
                // Exits-only mode for this symbol; no new entries from plans.
                continue;
            }
            if !all_conditions_met(&plan, &snapshot, &self.news, now_ms) {
                continue;
            }

            info!(plan_id = %plan.plan_id, symbol = %plan.symbol, "plan triggered");
            self.transition(&plan.plan_id, PlanState::Triggered);
            self.events.publish(
                EventRecord::action("planner", "plan_triggered")
                    .with_symbol(plan.symbol.clone())
                    .with_payload(serde_json::json!({"plan_id": plan.plan_id})),
            );

            match self.gateway.submit(&plan.to_trade_spec()).await {
                SubmitOutcome::Placed(ack) => {
                    info!(plan_id = %plan.plan_id, ticket = ack.ticket, "plan executed");
                    self.transition(&plan.plan_id, PlanState::Executed);
                    self.events.publish(
                        EventRecord::action("planner", "plan_executed")
                            .with_symbol(plan.symbol.clone())
                            .with_ticket(ack.ticket)
                            .with_payload(serde_json::json!({"plan_id": plan.plan_id})),
                    );
                }
                SubmitOutcome::Rejected(reason) => {
                    warn!(plan_id = %plan.plan_id, reason = %reason, "plan rejected");
                    self.transition(&plan.plan_id, PlanState::Cancelled);
                    self.events.publish(
                        EventRecord::action("planner", "plan_rejected")
                            .with_symbol(plan.symbol.clone())
                            .with_payload(serde_json::json!({
                                "plan_id": plan.plan_id,
                                "reason": reason,
                            }))
                            .with_severity(Severity::Warning),
                    );
                }
                SubmitOutcome::Failed(error) => {
                    // Transient: back to PENDING, retried next cycle.
                    warn!(plan_id = %plan.plan_id, error = %error, "plan dispatch failed — will retry");
                    self.revert_to_pending(&plan.plan_id);
                }
            }
        }
    }

    fn transition(&self, plan_id: &str, state: PlanState) {
        if let Some(plan) = self.plans.write().get_mut(plan_id) {
            plan.state = state;
            plan.updated_at = chrono::Utc::now().to_rfc3339();
        }
        self.persist();
    }

    fn revert_to_pending(&self, plan_id: &str) {
        if let Some(plan) = self.plans.write().get_mut(plan_id) {
            if plan.state == PlanState::Triggered {
                plan.state = PlanState::Pending;
                plan.updated_at = chrono::Utc::now().to_rfc3339();
            }
        }
        self.persist();
    }

    fn persist(&self) {
        let keyed: HashMap<String, Plan> = self.plans.read().clone();
        if let Err(e) = self.store.save(&keyed) {
            warn!(error = %e, "failed to persist plans");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::Features;
    use crate::market_data::FrameView;
    use std::collections::HashMap as StdHashMap;

    fn snapshot(price: f64) -> Snapshot {
        let mut m5 = Features::unavailable();
        m5.atr_expansion = Some(1.2);
        let mut frames = StdHashMap::new();
        frames.insert(
            Timeframe::M5,
            FrameView {
                candles: Vec::new(),
                open_candle: None,
                features: m5,
                fresh: true,
            },
        );
        frames.insert(
            Timeframe::M15,
            FrameView {
                candles: Vec::new(),
                open_candle: None,
                features: Features::unavailable(),
                fresh: true,
            },
        );
        Snapshot {
            snapshot_id: 1,
            symbol: "XAUUSD".into(),
            as_of_ms: 0,
            stale: false,
            last_price: Some(price),
            spread: Some(0.5),
            frames,
        }
    }

    #[test]
    fn price_conditions() {
        let news = NewsCalendar::new();
        let snap = snapshot(2450.0);
        assert!(condition_met(
            &Condition::PriceAbove { level: 2440.0 },
            &snap,
            &news,
            0
        ));
        assert!(!condition_met(
            &Condition::PriceAbove { level: 2460.0 },
            &snap,
            &news,
            0
        ));
        assert!(condition_met(
            &Condition::PriceBelow { level: 2460.0 },
            &snap,
            &news,
            0
        ));
    }

    #[test]
    fn time_conditions() {
        let news = NewsCalendar::new();
        let snap = snapshot(2450.0);
        assert!(condition_met(
            &Condition::TimeAfter { epoch_ms: 100 },
            &snap,
            &news,
            200
        ));
        assert!(!condition_met(
            &Condition::TimeBefore { epoch_ms: 100 },
            &snap,
            &news,
            200
        ));
    }

    #[test]
    fn volatility_conditions() {
        let news = NewsCalendar::new();
        let snap = snapshot(2450.0); // atr_expansion = 1.2
        assert!(condition_met(
            &Condition::MinVolatility { atr_ratio: 1.0 },
            &snap,
            &news,
            0
        ));
        assert!(!condition_met(
            &Condition::MinVolatility { atr_ratio: 1.5 },
            &snap,
            &news,
            0
        ));
        assert!(condition_met(
            &Condition::MaxVolatility { atr_ratio: 1.5 },
            &snap,
            &news,
            0
        ));
    }

    #[test]
    fn news_clear_condition() {
        let news = NewsCalendar::new();
        let snap = snapshot(2450.0);
        assert!(condition_met(&Condition::NewsClear, &snap, &news, 500));

        news.add(crate::session::NewsWindow {
            label: "NFP".into(),
            symbol: None,
            start_ms: 0,
            end_ms: 1_000,
        });
        assert!(!condition_met(&Condition::NewsClear, &snap, &news, 500));
    }

    #[test]
    fn all_conditions_are_conjunctive() {
        let news = NewsCalendar::new();
        let snap = snapshot(2450.0);
        let plan = Plan {
            plan_id: "p1".into(),
            symbol: "XAUUSD".into(),
            direction: Side::Buy,
            entry: 2451.0,
            sl: 2446.0,
            tp: 2460.0,
            volume: Some(0.02),
            order_type: OrderKind::Market,
            conditions: vec![
                Condition::PriceAbove { level: 2440.0 },
                Condition::PriceBelow { level: 2445.0 }, // false
            ],
            expires_at: i64::MAX,
            state: PlanState::Pending,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(!all_conditions_met(&plan, &snap, &news, 0));
    }

    #[test]
    fn condition_serde_tagged() {
        let condition = Condition::ChochDetected {
            direction: StructDirection::Bear,
        };
        let json = serde_json::to_string(&condition).unwrap();
        assert!(json.contains("\"type\":\"choch_detected\""));
        assert!(json.contains("\"direction\":\"bear\""));
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, condition);

        let parsed: Condition =
            serde_json::from_str(r#"{"type":"price_above","level":2450.5}"#).unwrap();
        assert_eq!(parsed, Condition::PriceAbove { level: 2450.5 });
    }

    #[test]
    fn plan_to_trade_spec_carries_tag() {
        let plan = Plan {
            plan_id: "abc".into(),
            symbol: "XAUUSD".into(),
            direction: Side::Sell,
            entry: 2440.0,
            sl: 2444.0,
            tp: 2430.0,
            volume: None,
            order_type: OrderKind::Stop,
            conditions: Vec::new(),
            expires_at: 0,
            state: PlanState::Pending,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let spec = plan.to_trade_spec();
        assert_eq!(spec.side, Side::Sell);
        assert_eq!(spec.order_type, OrderKind::Stop);
        assert!(spec.tags.contains(&"plan=abc".to_string()));
    }
}
