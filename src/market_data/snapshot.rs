// =============================================================================
// Snapshot — a consistent multi-timeframe read for one symbol
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::indicators::Features;

use super::{Candle, Timeframe};

/// One timeframe's view inside a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FrameView {
    /// Most recent complete candles, oldest first.
    pub candles: Vec<Candle>,
    /// The still-forming candle, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_candle: Option<Candle>,
    pub features: Features,
    /// False when the newest complete candle exceeded the staleness budget.
    pub fresh: bool,
}

/// Consistent per-symbol read across all timeframes. `snapshot_id` is
/// strictly increasing per symbol; consumers may rely on the ordering.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub snapshot_id: u64,
    pub symbol: String,
    pub as_of_ms: i64,
    /// True when any decision-critical timeframe is not fresh.
    pub stale: bool,
    pub last_price: Option<f64>,
    pub spread: Option<f64>,
    pub frames: HashMap<Timeframe, FrameView>,
}

impl Snapshot {
    pub fn frame(&self, tf: Timeframe) -> Option<&FrameView> {
        self.frames.get(&tf)
    }

    pub fn features(&self, tf: Timeframe) -> Option<&Features> {
        self.frames.get(&tf).map(|f| &f.features)
    }

    pub fn atr(&self, tf: Timeframe) -> Option<f64> {
        self.features(tf).and_then(|f| f.atr14)
    }

    /// Count of timeframes (among the given set) whose EMA stack is aligned
    /// with `bullish`. Feeds the exit manager's multi-timeframe gate.
    pub fn alignment_score(&self, frames: &[Timeframe], bullish: bool) -> u8 {
        frames
            .iter()
            .filter_map(|tf| self.features(*tf).and_then(|f| f.ema_aligned))
            .filter(|aligned| *aligned == bullish)
            .count() as u8
    }
}
