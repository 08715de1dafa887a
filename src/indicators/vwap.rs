// =============================================================================
// Session-Anchored VWAP with σ bands
// =============================================================================
//
// VWAP accumulates typical-price * volume from the session anchor (UTC day
// open). The σ bands are volume-weighted standard deviations around VWAP;
// the zone classification feeds the exit manager's mean-reversion gate:
//
//   INSIDE  — within ±1σ
//   UPPER / LOWER — between 1σ and 2σ
//   OUTER   — beyond ±2σ (stretched; trailing pauses, protector tightens)
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;

/// Zone of the current price relative to the VWAP bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VwapZone {
    Inside,
    Upper,
    Lower,
    Outer,
}

impl std::fmt::Display for VwapZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inside => write!(f, "inside"),
            Self::Upper => write!(f, "upper"),
            Self::Lower => write!(f, "lower"),
            Self::Outer => write!(f, "outer"),
        }
    }
}

/// Session VWAP and its ±1σ/±2σ bands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapResult {
    pub vwap: f64,
    pub upper_1: f64,
    pub lower_1: f64,
    pub upper_2: f64,
    pub lower_2: f64,
    pub zone: VwapZone,
}

/// Compute session VWAP from candles at or after `session_open_ms`.
///
/// `current_price` decides the zone. Returns `None` when the session has no
/// candles or no volume.
pub fn session_vwap(
    candles: &[Candle],
    session_open_ms: i64,
    current_price: f64,
) -> Option<VwapResult> {
    let session: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.open_time_ms >= session_open_ms)
        .collect();
    if session.is_empty() {
        return None;
    }

    let mut pv = 0.0;
    let mut vol = 0.0;
    for c in &session {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        vol += c.volume;
    }
    if vol <= 0.0 {
        return None;
    }
    let vwap = pv / vol;

    // Volume-weighted variance of typical price around VWAP.
    let mut var_acc = 0.0;
    for c in &session {
        let typical = (c.high + c.low + c.close) / 3.0;
        var_acc += (typical - vwap).powi(2) * c.volume;
    }
    let sigma = (var_acc / vol).sqrt();
    if !vwap.is_finite() || !sigma.is_finite() {
        return None;
    }

    let upper_1 = vwap + sigma;
    let lower_1 = vwap - sigma;
    let upper_2 = vwap + 2.0 * sigma;
    let lower_2 = vwap - 2.0 * sigma;

    let zone = if sigma <= f64::EPSILON {
        VwapZone::Inside
    } else if current_price > upper_2 || current_price < lower_2 {
        VwapZone::Outer
    } else if current_price > upper_1 {
        VwapZone::Upper
    } else if current_price < lower_1 {
        VwapZone::Lower
    } else {
        VwapZone::Inside
    };

    Some(VwapResult {
        vwap,
        upper_1,
        lower_1,
        upper_2,
        lower_2,
        zone,
    })
}

/// Session high/low from candles at or after `session_open_ms`.
pub fn session_high_low(candles: &[Candle], session_open_ms: i64) -> Option<(f64, f64)> {
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut any = false;
    for c in candles.iter().filter(|c| c.open_time_ms >= session_open_ms) {
        high = high.max(c.high);
        low = low.min(c.low);
        any = true;
    }
    (any && high.is_finite() && low.is_finite()).then_some((high, low))
}

/// Previous-day high/low: candles in `[day_open_ms - 1 day, day_open_ms)`.
pub fn previous_day_high_low(candles: &[Candle], day_open_ms: i64) -> Option<(f64, f64)> {
    const DAY_MS: i64 = 86_400_000;
    let prev_open = day_open_ms - DAY_MS;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut any = false;
    for c in candles
        .iter()
        .filter(|c| c.open_time_ms >= prev_open && c.open_time_ms < day_open_ms)
    {
        high = high.max(c.high);
        low = low.min(c.low);
        any = true;
    }
    (any && high.is_finite() && low.is_finite()).then_some((high, low))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time_ms: i64, price: f64, volume: f64) -> Candle {
        Candle {
            open_time_ms,
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume,
            complete: true,
        }
    }

    #[test]
    fn vwap_empty_session() {
        let candles = vec![candle(0, 100.0, 10.0)];
        assert!(session_vwap(&candles, 1_000_000, 100.0).is_none());
    }

    #[test]
    fn vwap_weighted_by_volume() {
        // Heavy volume at 100, light at 110 — VWAP pulled toward 100.
        let candles = vec![candle(0, 100.0, 90.0), candle(60_000, 110.0, 10.0)];
        let result = session_vwap(&candles, 0, 100.0).unwrap();
        assert!(result.vwap < 102.0, "VWAP {} should sit near 100", result.vwap);
    }

    #[test]
    fn vwap_zone_classification() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(i * 60_000, 100.0 + (i as f64 * 0.7).sin() * 2.0, 10.0))
            .collect();
        let result = session_vwap(&candles, 0, 100.0).unwrap();
        assert_eq!(result.zone, VwapZone::Inside);

        let stretched = session_vwap(&candles, 0, result.upper_2 + 5.0).unwrap();
        assert_eq!(stretched.zone, VwapZone::Outer);

        let upper = session_vwap(&candles, 0, (result.upper_1 + result.upper_2) / 2.0).unwrap();
        assert_eq!(upper.zone, VwapZone::Upper);
    }

    #[test]
    fn session_high_low_filters_by_anchor() {
        let candles = vec![
            candle(0, 100.0, 10.0),
            candle(60_000, 120.0, 10.0),
            candle(120_000, 90.0, 10.0),
        ];
        let (high, low) = session_high_low(&candles, 60_000).unwrap();
        assert_eq!(high, 121.0);
        assert_eq!(low, 89.0);
    }

    #[test]
    fn previous_day_window() {
        const DAY: i64 = 86_400_000;
        let candles = vec![
            candle(DAY - 120_000, 200.0, 10.0), // previous day
            candle(DAY - 60_000, 180.0, 10.0),  // previous day
            candle(DAY + 60_000, 100.0, 10.0),  // today
        ];
        let (pdh, pdl) = previous_day_high_low(&candles, DAY).unwrap();
        assert_eq!(pdh, 201.0);
        assert_eq!(pdl, 179.0);
    }
}
