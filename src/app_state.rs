// =============================================================================
// Central Application State — Meridian Trade Engine
// =============================================================================
//
// One AppState is built in main and handed to every task as an Arc. It
// carries the engine's shared mutable surface — market-data handles, regime
// trackers, the advisor inbox, audit rings, and the order-queue sender —
// and is what the ops API reads.
//
// Concurrency model: monotonic counters are plain atomics; collections
// mutated from several tasks sit behind parking_lot locks; subsystems that
// already manage their own interior mutability are carried as Arc handles.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::broker::gateway::OrderCommand;
use crate::broker::Position;
use crate::decision::{Decision, TradeSpec};
use crate::events::EventBus;
use crate::latency::LatencyTracker;
use crate::market_data::order_flow::OrderFlowTracker;
use crate::market_data::{MarketRings, SnapshotHub, Timeframe};
use crate::regime::RegimeTracker;
use crate::runtime_config::EngineConfig;
use crate::session::NewsCalendar;

/// Error ring capacity.
const MAX_RECENT_ERRORS: usize = 50;
/// Decision audit ring capacity.
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event for the ops error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub at: String,
}

/// Shared engine state; every task holds it as an `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation so pollers can detect fresh data cheaply.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<EngineConfig>>,

    // ── Market data ─────────────────────────────────────────────────────
    pub rings: Arc<MarketRings>,
    pub hub: Arc<SnapshotHub>,
    pub flow: Arc<OrderFlowTracker>,

    // ── Classification ──────────────────────────────────────────────────
    pub regimes: RwLock<HashMap<String, RegimeTracker>>,

    // ── External context ────────────────────────────────────────────────
    pub news: Arc<NewsCalendar>,
    pub vix: Arc<RwLock<Option<f64>>>,

    // ── Positions (read-only mirror) ────────────────────────────────────
    pub positions_mirror: Arc<RwLock<Vec<Position>>>,

    // ── Advisor inbox ───────────────────────────────────────────────────
    pub proposals: RwLock<HashMap<String, Vec<TradeSpec>>>,

    // ── Audit trails ────────────────────────────────────────────────────
    pub recent_decisions: RwLock<Vec<Decision>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Plumbing ────────────────────────────────────────────────────────
    pub events: EventBus,
    pub latency: Arc<LatencyTracker>,
    pub order_tx: mpsc::Sender<OrderCommand>,

    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime_config: Arc<RwLock<EngineConfig>>,
        rings: Arc<MarketRings>,
        hub: Arc<SnapshotHub>,
        flow: Arc<OrderFlowTracker>,
        news: Arc<NewsCalendar>,
        vix: Arc<RwLock<Option<f64>>>,
        positions_mirror: Arc<RwLock<Vec<Position>>>,
        events: EventBus,
        latency: Arc<LatencyTracker>,
        order_tx: mpsc::Sender<OrderCommand>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config,
            rings,
            hub,
            flow,
            regimes: RwLock::new(HashMap::new()),
            news,
            vix,
            positions_mirror,
            proposals: RwLock::new(HashMap::new()),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            events,
            latency,
            order_tx,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error; the ring is capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: impl Into<String>, code: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Record a decision; the ring is capped at [`MAX_RECENT_DECISIONS`].
    pub fn push_decision(&self, decision: Decision) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    /// Queue an advisor proposal for the symbol's next decision pass.
    pub fn push_proposal(&self, spec: TradeSpec) {
        self.proposals
            .write()
            .entry(spec.symbol.clone())
            .or_default()
            .push(spec);
        self.increment_version();
    }

    /// Take all queued proposals for a symbol.
    pub fn drain_proposals(&self, symbol: &str) -> Vec<TradeSpec> {
        self.proposals
            .write()
            .get_mut(symbol)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Per-(symbol, timeframe) freshness for the health surface.
    pub fn freshness(&self) -> HashMap<String, HashMap<String, bool>> {
        let mut out = HashMap::new();
        for symbol in self.hub.symbols() {
            let Some(snapshot) = self.hub.latest(&symbol) else {
                continue;
            };
            let mut frames = HashMap::new();
            for tf in Timeframe::ALL {
                frames.insert(
                    tf.to_string(),
                    snapshot.frame(tf).map(|f| f.fresh).unwrap_or(false),
                );
            }
            out.insert(symbol, frames);
        }
        out
    }

    /// Symbols currently restricted to exits-only (stale decision frames).
    pub fn exits_only_symbols(&self) -> Vec<String> {
        self.hub
            .symbols()
            .into_iter()
            .filter(|s| self.hub.latest(s).map(|snap| snap.stale).unwrap_or(true))
            .collect()
    }
}
