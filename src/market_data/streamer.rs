// =============================================================================
// Multi-Timeframe Streamer — per-symbol ingestion pipeline
// =============================================================================
//
// One task per symbol owns the candle aggregator and drives the whole hot
// path: tick intake, ring updates, order-flow accounting, per-timeframe
// feature refresh, and snapshot publication. The decision hook runs
// synchronously inside this task after every published snapshot; it must not
// block (order actions go to a bounded queue).
//
// Feature refresh cadence per timeframe: M1 1s, M5 5s, M15/M30 30s, H1 5min,
// H4 15min. Snapshots are published on every refresh round.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::indicators::Features;
use crate::latency::LatencyTracker;

use super::aggregator::CandleAggregator;
use super::order_flow::OrderFlowTracker;
use super::{CandleKey, FrameView, MarketRings, Snapshot, Tick, Timeframe};

/// Complete candles handed to the feature computation per frame.
const FRAME_CANDLES: usize = 400;

/// Timeframes whose staleness forces a symbol into exits-only mode.
pub const DECISION_FRAMES: [Timeframe; 3] = [Timeframe::M5, Timeframe::M15, Timeframe::H1];

/// Latest snapshot per symbol plus the monotonic id source.
pub struct SnapshotHub {
    latest: RwLock<HashMap<String, Arc<Snapshot>>>,
    next_id: AtomicU64,
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        snapshot.snapshot_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let arc = Arc::new(snapshot);
        self.latest
            .write()
            .insert(arc.symbol.clone(), Arc::clone(&arc));
        arc
    }

    pub fn latest(&self, symbol: &str) -> Option<Arc<Snapshot>> {
        self.latest.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.latest.read().keys().cloned().collect()
    }
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the ingestion pipeline for one symbol until the tick channel closes.
///
/// `on_snapshot` is the synchronous decision hook; it receives every
/// published snapshot.
pub async fn run_symbol_pipeline(
    symbol: String,
    mut ticks: mpsc::Receiver<Tick>,
    rings: Arc<MarketRings>,
    flow: Arc<OrderFlowTracker>,
    hub: Arc<SnapshotHub>,
    latency: Arc<LatencyTracker>,
    on_snapshot: Arc<dyn Fn(Arc<Snapshot>) + Send + Sync>,
) {
    info!(symbol = %symbol, "symbol pipeline started");

    let mut aggregator = CandleAggregator::new(symbol.clone());
    let mut last_refresh: HashMap<Timeframe, Instant> = HashMap::new();
    let mut cached_features: HashMap<Timeframe, Features> = HashMap::new();
    let mut refresh_tick = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            maybe_tick = ticks.recv() => {
                let Some(tick) = maybe_tick else {
                    info!(symbol = %symbol, "tick stream closed — pipeline stopping");
                    return;
                };
                let started = Instant::now();
                if rings.push_tick(tick.clone()) {
                    flow.record(&tick);
                    let update = aggregator.on_tick(&tick);
                    for (key, candle) in update.candles {
                        rings.push_candle(key, candle);
                    }
                }
                latency.record("ingest", started.elapsed());
            }
            _ = refresh_tick.tick() => {
                let started = Instant::now();
                let mut refreshed = false;
                let now = Instant::now();

                for tf in Timeframe::ALL {
                    let due = last_refresh
                        .get(&tf)
                        .map(|t| now.duration_since(*t).as_secs() >= tf.refresh_secs())
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    let key = CandleKey::new(symbol.clone(), tf);
                    let candles = rings.candles(&key, FRAME_CANDLES);
                    let features = Features::compute(&candles, flow.imbalance(&symbol));
                    cached_features.insert(tf, features);
                    last_refresh.insert(tf, now);
                    refreshed = true;
                }

                if refreshed {
                    let snapshot = build_snapshot(
                        &symbol,
                        &rings,
                        &cached_features,
                        Utc::now().timestamp_millis(),
                    );
                    latency.record("feature", started.elapsed());
                    let published = hub.publish(snapshot);
                    debug!(
                        symbol = %symbol,
                        snapshot_id = published.snapshot_id,
                        stale = published.stale,
                        "snapshot published"
                    );
                    on_snapshot(published);
                }
            }
        }
    }
}

fn build_snapshot(
    symbol: &str,
    rings: &MarketRings,
    features: &HashMap<Timeframe, Features>,
    now_ms: i64,
) -> Snapshot {
    let mut frames = HashMap::new();
    let mut stale = false;

    for tf in Timeframe::ALL {
        let key = CandleKey::new(symbol.to_string(), tf);
        let candles = rings.candles(&key, FRAME_CANDLES);
        let fresh = frame_is_fresh(rings, &key, now_ms);
        if !fresh && DECISION_FRAMES.contains(&tf) {
            stale = true;
        }
        frames.insert(
            tf,
            FrameView {
                candles,
                open_candle: rings.open_candle(&key),
                features: features
                    .get(&tf)
                    .cloned()
                    .unwrap_or_else(Features::unavailable),
                fresh,
            },
        );
    }

    let last_tick = rings.latest_tick(symbol);
    Snapshot {
        snapshot_id: 0, // assigned by the hub
        symbol: symbol.to_string(),
        as_of_ms: now_ms,
        stale,
        last_price: last_tick.as_ref().map(Tick::mid),
        spread: last_tick.as_ref().map(Tick::spread),
        frames,
    }
}

/// A frame is fresh while its newest complete candle closed within the
/// staleness budget (2x candle duration plus one refresh interval).
fn frame_is_fresh(rings: &MarketRings, key: &CandleKey, now_ms: i64) -> bool {
    match rings.last_complete_open_ms(key) {
        Some(open_ms) => {
            let close_ms = open_ms + key.timeframe.duration_ms();
            now_ms - close_ms <= key.timeframe.staleness_budget_ms()
        }
        None => false,
    }
}
