// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Classification rules, evaluated top-to-bottom (first match wins):
//
//   1. TREND    — ADX(H1 or M15) > 25 AND the EMA 20/50/200 stack is aligned
//                 in one direction on at least two of {M5, M15, H1}.
//   2. VOLATILE — ATR(M5) expansion ratio >= 1.4 OR Bollinger width >= 1.8x
//                 its trailing median.
//   3. RANGE    — ADX(M15) < 20 AND Bollinger width < 0.5x its median AND
//                 price inside the session high/low.
//   4. UNKNOWN  — nothing matched.
//
// A raw classification never flips the confirmed regime directly: a change
// needs 3 consecutive identical raw reads, and a confirmed regime holds for
// at least 5 reads before it may change again.
// =============================================================================

use serde::Serialize;
use tracing::{debug, trace};

use crate::market_data::{Snapshot, Timeframe};

/// Confirmations required before a new regime is accepted.
const CONFIRM_STREAK: u32 = 3;

/// Minimum reads a confirmed regime holds before it may change.
const MIN_HOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Regime {
    Trend,
    Range,
    Volatile,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trend => write!(f, "TREND"),
            Self::Range => write!(f, "RANGE"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A classification together with its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub confidence: f64,
}

/// Classify one snapshot without any persistence filtering.
pub fn classify_raw(snapshot: &Snapshot) -> RegimeReading {
    let m5 = snapshot.features(Timeframe::M5);
    let m15 = snapshot.features(Timeframe::M15);
    let h1 = snapshot.features(Timeframe::H1);

    let adx_m15 = m15.and_then(|f| f.adx.map(|a| a.adx));
    let adx_h1 = h1.and_then(|f| f.adx.map(|a| a.adx));

    // --- TREND ---------------------------------------------------------------
    let adx_trending = adx_h1.map(|a| a > 25.0).unwrap_or(false)
        || adx_m15.map(|a| a > 25.0).unwrap_or(false);
    if adx_trending {
        let bull = snapshot.alignment_score(&[Timeframe::M5, Timeframe::M15, Timeframe::H1], true);
        let bear = snapshot.alignment_score(&[Timeframe::M5, Timeframe::M15, Timeframe::H1], false);
        let aligned = bull.max(bear);
        if aligned >= 2 {
            let adx = adx_h1.or(adx_m15).unwrap_or(25.0);
            let adx_conf = remap(adx, 25.0, 50.0, 0.6, 1.0);
            let align_conf = remap(aligned as f64, 2.0, 3.0, 0.7, 1.0);
            return RegimeReading {
                regime: Regime::Trend,
                confidence: (adx_conf + align_conf) / 2.0,
            };
        }
    }

    // --- VOLATILE ------------------------------------------------------------
    let expansion = m5.and_then(|f| f.atr_expansion);
    let bb_ratio = m15.and_then(|f| {
        let width = f.bollinger.map(|b| b.width)?;
        let median = f.bb_width_median?;
        (median > 0.0).then(|| width / median)
    });
    let vol_by_atr = expansion.map(|r| r >= 1.4).unwrap_or(false);
    let vol_by_bb = bb_ratio.map(|r| r >= 1.8).unwrap_or(false);
    if vol_by_atr || vol_by_bb {
        let atr_conf = expansion.map(|r| remap(r, 1.4, 2.5, 0.6, 1.0)).unwrap_or(0.0);
        let bb_conf = bb_ratio.map(|r| remap(r, 1.8, 3.0, 0.6, 1.0)).unwrap_or(0.0);
        return RegimeReading {
            regime: Regime::Volatile,
            confidence: atr_conf.max(bb_conf),
        };
    }

    // --- RANGE ---------------------------------------------------------------
    let adx_quiet = adx_m15.map(|a| a < 20.0).unwrap_or(false);
    let bb_tight = bb_ratio.map(|r| r < 0.5).unwrap_or(false);
    let inside_session = (|| {
        let f = m15?;
        let price = snapshot.last_price.or(f.last_close)?;
        let high = f.session_high?;
        let low = f.session_low?;
        Some(price <= high && price >= low)
    })()
    .unwrap_or(false);
    if adx_quiet && bb_tight && inside_session {
        let adx_conf = remap(adx_m15.unwrap_or(20.0), 20.0, 5.0, 0.5, 1.0);
        let bb_conf = remap(bb_ratio.unwrap_or(0.5), 0.5, 0.1, 0.5, 1.0);
        return RegimeReading {
            regime: Regime::Range,
            confidence: (adx_conf + bb_conf) / 2.0,
        };
    }

    trace!(symbol = %snapshot.symbol, "regime: no rule matched");
    RegimeReading {
        regime: Regime::Unknown,
        confidence: 0.0,
    }
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Persistence filter
// =============================================================================

/// Per-symbol regime state with confirmation streak and hold inertia.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeTracker {
    pub confirmed: Regime,
    pub confidence: f64,
    /// Reads since the confirmed regime was accepted.
    held_for: u32,
    pending: Option<Regime>,
    pending_streak: u32,
}

impl RegimeTracker {
    pub fn new() -> Self {
        Self {
            confirmed: Regime::Unknown,
            confidence: 0.0,
            held_for: 0,
            pending: None,
            pending_streak: 0,
        }
    }

    /// Feed one raw reading; returns the confirmed (possibly held) regime.
    pub fn update(&mut self, raw: RegimeReading) -> RegimeReading {
        self.held_for = self.held_for.saturating_add(1);

        if raw.regime == self.confirmed {
            self.pending = None;
            self.pending_streak = 0;
            self.confidence = raw.confidence;
        } else {
            if self.pending == Some(raw.regime) {
                self.pending_streak += 1;
            } else {
                self.pending = Some(raw.regime);
                self.pending_streak = 1;
            }

            if self.pending_streak >= CONFIRM_STREAK && self.held_for >= MIN_HOLD {
                debug!(
                    from = %self.confirmed,
                    to = %raw.regime,
                    streak = self.pending_streak,
                    "regime change confirmed"
                );
                self.confirmed = raw.regime;
                self.confidence = raw.confidence;
                self.held_for = 0;
                self.pending = None;
                self.pending_streak = 0;
            }
        }

        RegimeReading {
            regime: self.confirmed,
            confidence: self.confidence,
        }
    }
}

impl Default for RegimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::features::AdxSummary;
    use crate::indicators::Features;
    use crate::market_data::FrameView;
    use std::collections::HashMap;

    fn frame(features: Features) -> FrameView {
        FrameView {
            candles: Vec::new(),
            open_candle: None,
            features,
            fresh: true,
        }
    }

    fn snapshot(frames: Vec<(Timeframe, Features)>) -> Snapshot {
        Snapshot {
            snapshot_id: 1,
            symbol: "XAUUSD".into(),
            as_of_ms: 0,
            stale: false,
            last_price: Some(2450.0),
            spread: Some(0.5),
            frames: frames
                .into_iter()
                .map(|(tf, f)| (tf, frame(f)))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn trending_features(adx: f64) -> Features {
        let mut f = Features::unavailable();
        f.adx = Some(AdxSummary {
            adx,
            di_plus: 30.0,
            di_minus: 10.0,
        });
        f.ema_aligned = Some(true);
        f.last_close = Some(2450.0);
        f
    }

    #[test]
    fn trend_classification() {
        let snap = snapshot(vec![
            (Timeframe::M5, trending_features(30.0)),
            (Timeframe::M15, trending_features(30.0)),
            (Timeframe::H1, trending_features(32.0)),
        ]);
        let reading = classify_raw(&snap);
        assert_eq!(reading.regime, Regime::Trend);
        assert!(reading.confidence > 0.6);
    }

    #[test]
    fn trend_needs_alignment() {
        let mut m15 = trending_features(30.0);
        m15.ema_aligned = None;
        let mut h1 = trending_features(32.0);
        h1.ema_aligned = None;
        let mut m5 = trending_features(10.0);
        m5.ema_aligned = Some(true);
        let snap = snapshot(vec![
            (Timeframe::M5, m5),
            (Timeframe::M15, m15),
            (Timeframe::H1, h1),
        ]);
        assert_ne!(classify_raw(&snap).regime, Regime::Trend);
    }

    #[test]
    fn volatile_by_atr_expansion() {
        let mut m5 = Features::unavailable();
        m5.atr_expansion = Some(1.6);
        let snap = snapshot(vec![(Timeframe::M5, m5)]);
        let reading = classify_raw(&snap);
        assert_eq!(reading.regime, Regime::Volatile);
    }

    #[test]
    fn range_requires_all_conditions() {
        let mut m15 = Features::unavailable();
        m15.adx = Some(AdxSummary {
            adx: 15.0,
            di_plus: 12.0,
            di_minus: 11.0,
        });
        m15.bollinger = Some(crate::indicators::features::BollingerSummary {
            upper: 2455.0,
            middle: 2450.0,
            lower: 2445.0,
            width: 0.4,
        });
        m15.bb_width_median = Some(1.0);
        m15.session_high = Some(2460.0);
        m15.session_low = Some(2440.0);
        m15.last_close = Some(2450.0);
        let snap = snapshot(vec![(Timeframe::M15, m15)]);
        assert_eq!(classify_raw(&snap).regime, Regime::Range);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let snap = snapshot(vec![(Timeframe::M15, Features::unavailable())]);
        let reading = classify_raw(&snap);
        assert_eq!(reading.regime, Regime::Unknown);
        assert_eq!(reading.confidence, 0.0);
    }

    fn reading(regime: Regime) -> RegimeReading {
        RegimeReading {
            regime,
            confidence: 0.8,
        }
    }

    #[test]
    fn tracker_requires_three_confirmations() {
        let mut tracker = RegimeTracker::new();
        // Build up the hold requirement first.
        for _ in 0..5 {
            tracker.update(reading(Regime::Unknown));
        }
        assert_eq!(tracker.update(reading(Regime::Trend)).regime, Regime::Unknown);
        assert_eq!(tracker.update(reading(Regime::Trend)).regime, Regime::Unknown);
        // Third consecutive read confirms.
        assert_eq!(tracker.update(reading(Regime::Trend)).regime, Regime::Trend);
    }

    #[test]
    fn tracker_streak_resets_on_interruption() {
        let mut tracker = RegimeTracker::new();
        for _ in 0..5 {
            tracker.update(reading(Regime::Unknown));
        }
        tracker.update(reading(Regime::Trend));
        tracker.update(reading(Regime::Trend));
        tracker.update(reading(Regime::Unknown)); // interrupts the streak
        tracker.update(reading(Regime::Trend));
        tracker.update(reading(Regime::Trend));
        let out = tracker.update(reading(Regime::Trend));
        assert_eq!(out.regime, Regime::Trend);
    }

    #[test]
    fn tracker_inertia_blocks_early_flip() {
        let mut tracker = RegimeTracker::new();
        for _ in 0..5 {
            tracker.update(reading(Regime::Unknown));
        }
        for _ in 0..3 {
            tracker.update(reading(Regime::Trend));
        }
        assert_eq!(tracker.confirmed, Regime::Trend);

        // Immediately flood with RANGE: held_for < 5 blocks the change.
        for _ in 0..4 {
            let out = tracker.update(reading(Regime::Range));
            assert_eq!(out.regime, Regime::Trend, "inertia must hold the regime");
        }
        // After the hold expires the pending streak can take effect.
        let out = tracker.update(reading(Regime::Range));
        assert_eq!(out.regime, Regime::Range);
    }
}
