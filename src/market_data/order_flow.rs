// =============================================================================
// Order Flow Tracker — rolling buy/sell pressure and whale detection
// =============================================================================
//
// Aggressor classification from quotes: a tick whose last trade prints at or
// above the ask is buyer-initiated, at or below the bid seller-initiated.
// Ticks without a last price fall back to mid-price direction versus the
// previous tick.
//
// Whale pressure: a single flow event whose volume exceeds `whale_z` standard
// deviations above the rolling mean marks institutional participation in that
// direction for the lifetime of the window.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::Side;

use super::Tick;

/// Number of flow events retained per symbol.
const WINDOW: usize = 500;

/// Z-score above which a single event counts as a whale print.
const WHALE_Z: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
struct FlowEvent {
    side: Side,
    volume: f64,
    epoch_ms: i64,
}

/// A detected large opposing/supporting flow event.
#[derive(Debug, Clone, Serialize)]
pub struct WhaleAdvisory {
    pub direction: Side,
    /// Volume z-score of the triggering event.
    pub strength: f64,
    pub detected_at_ms: i64,
}

struct FlowState {
    events: VecDeque<FlowEvent>,
    last_mid: Option<f64>,
    whale: Option<WhaleAdvisory>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(WINDOW),
            last_mid: None,
            whale: None,
        }
    }

    fn record(&mut self, tick: &Tick) {
        let mid = tick.mid();
        let side = match tick.last {
            Some(last) if last >= tick.ask => Some(Side::Buy),
            Some(last) if last <= tick.bid => Some(Side::Sell),
            _ => match self.last_mid {
                Some(prev) if mid > prev => Some(Side::Buy),
                Some(prev) if mid < prev => Some(Side::Sell),
                _ => None,
            },
        };
        self.last_mid = Some(mid);

        let Some(side) = side else { return };
        let volume = tick.volume.unwrap_or(1.0);

        // Whale check against the window *before* inserting the event.
        if self.events.len() >= 30 {
            let n = self.events.len() as f64;
            let mean: f64 = self.events.iter().map(|e| e.volume).sum::<f64>() / n;
            let var: f64 = self
                .events
                .iter()
                .map(|e| (e.volume - mean).powi(2))
                .sum::<f64>()
                / n;
            // Floor the deviation so a perfectly uniform tape (sd = 0)
            // still lets an outsized print register.
            let sd = var.sqrt().max(mean * 0.25);
            if sd > 0.0 {
                let z = (volume - mean) / sd;
                if z >= WHALE_Z {
                    self.whale = Some(WhaleAdvisory {
                        direction: side,
                        strength: z,
                        detected_at_ms: tick.epoch_ms,
                    });
                }
            }
        }

        if self.events.len() == WINDOW {
            self.events.pop_front();
        }
        self.events.push_back(FlowEvent {
            side,
            volume,
            epoch_ms: tick.epoch_ms,
        });

        // A whale advisory expires once its event leaves the window.
        if let Some(w) = &self.whale {
            let oldest = self.events.front().map(|e| e.epoch_ms).unwrap_or(i64::MIN);
            if w.detected_at_ms < oldest {
                self.whale = None;
            }
        }
    }

    fn imbalance(&self) -> Option<f64> {
        if self.events.len() < 20 {
            return None;
        }
        let (buy, sell) = self.events.iter().fold((0.0, 0.0), |(b, s), e| match e.side {
            Side::Buy => (b + e.volume, s),
            Side::Sell => (b, s + e.volume),
        });
        let total = buy + sell;
        if total <= 0.0 {
            return None;
        }
        Some((buy - sell) / total)
    }
}

/// Shared per-symbol order-flow state.
pub struct OrderFlowTracker {
    states: RwLock<HashMap<String, FlowState>>,
}

impl OrderFlowTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, tick: &Tick) {
        let mut map = self.states.write();
        map.entry(tick.symbol.clone())
            .or_insert_with(FlowState::new)
            .record(tick);
    }

    /// Buy/sell volume imbalance in [-1, 1]; `None` until the window has
    /// enough events.
    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.states.read().get(symbol).and_then(FlowState::imbalance)
    }

    pub fn whale(&self, symbol: &str) -> Option<WhaleAdvisory> {
        self.states.read().get(symbol).and_then(|s| s.whale.clone())
    }
}

impl Default for OrderFlowTracker {
    fn default() -> Self {
        Self::new()
    }
}
