// =============================================================================
// Market Structure — fractal swings, BOS, CHoCH
// =============================================================================
//
// Swings are detected with a symmetric fractal: a bar whose high exceeds the
// highs of `FRACTAL_WING` bars on each side is a swing high (lows mirror).
//
// Structure events are replayed over the confirmed swings:
//
//   BOS    — close breaks the last swing in the direction of the prevailing
//            trend (continuation).
//   CHoCH  — close breaks the last swing *against* the prevailing trend
//            (the first warning of reversal).
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;
use crate::types::Side;

/// Bars required on each side of a fractal swing point.
const FRACTAL_WING: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwingKind {
    High,
    Low,
}

/// A confirmed fractal swing point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub kind: SwingKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StructureEventKind {
    Bos,
    Choch,
}

impl std::fmt::Display for StructureEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bos => write!(f, "BOS"),
            Self::Choch => write!(f, "CHoCH"),
        }
    }
}

/// The most recent structural break.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StructureEvent {
    pub kind: StructureEventKind,
    /// Direction of the break: Buy = broke upward.
    pub direction: Side,
    /// How many bars ago the break closed (0 = latest bar).
    pub bars_ago: usize,
}

/// Structure read for a candle slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructureState {
    pub last_swing_high: Option<f64>,
    pub last_swing_low: Option<f64>,
    /// Prevailing trend direction established by the last break.
    pub trend: Option<Side>,
    pub event: Option<StructureEvent>,
}

/// Detect all confirmed fractal swings in order.
pub fn find_swings(candles: &[Candle]) -> Vec<SwingPoint> {
    let n = candles.len();
    if n < 2 * FRACTAL_WING + 1 {
        return Vec::new();
    }

    let mut swings = Vec::new();
    for i in FRACTAL_WING..(n - FRACTAL_WING) {
        let is_high = (1..=FRACTAL_WING).all(|w| {
            candles[i].high > candles[i - w].high && candles[i].high > candles[i + w].high
        });
        if is_high {
            swings.push(SwingPoint {
                index: i,
                price: candles[i].high,
                kind: SwingKind::High,
            });
            continue;
        }
        let is_low = (1..=FRACTAL_WING)
            .all(|w| candles[i].low < candles[i - w].low && candles[i].low < candles[i + w].low);
        if is_low {
            swings.push(SwingPoint {
                index: i,
                price: candles[i].low,
                kind: SwingKind::Low,
            });
        }
    }
    swings
}

/// Replay closes over the confirmed swings and report the latest structure.
pub fn analyze(candles: &[Candle]) -> StructureState {
    let swings = find_swings(candles);
    let mut state = StructureState {
        last_swing_high: None,
        last_swing_low: None,
        trend: None,
        event: None,
    };
    if swings.is_empty() {
        return state;
    }

    let mut swing_iter = swings.iter().peekable();
    let mut active_high: Option<f64> = None;
    let mut active_low: Option<f64> = None;

    for (i, candle) in candles.iter().enumerate() {
        // Activate swings as they become confirmed (wing bars have closed).
        while let Some(s) = swing_iter.peek() {
            if s.index + FRACTAL_WING <= i {
                match s.kind {
                    SwingKind::High => active_high = Some(s.price),
                    SwingKind::Low => active_low = Some(s.price),
                }
                swing_iter.next();
            } else {
                break;
            }
        }

        if let Some(high) = active_high {
            if candle.close > high {
                let kind = match state.trend {
                    Some(Side::Sell) => StructureEventKind::Choch,
                    _ => StructureEventKind::Bos,
                };
                state.event = Some(StructureEvent {
                    kind,
                    direction: Side::Buy,
                    bars_ago: candles.len() - 1 - i,
                });
                state.trend = Some(Side::Buy);
                active_high = None;
            }
        }
        if let Some(low) = active_low {
            if candle.close < low {
                let kind = match state.trend {
                    Some(Side::Buy) => StructureEventKind::Choch,
                    _ => StructureEventKind::Bos,
                };
                state.event = Some(StructureEvent {
                    kind,
                    direction: Side::Sell,
                    bars_ago: candles.len() - 1 - i,
                });
                state.trend = Some(Side::Sell);
                active_low = None;
            }
        }
    }

    state.last_swing_high = swings
        .iter()
        .rev()
        .find(|s| s.kind == SwingKind::High)
        .map(|s| s.price);
    state.last_swing_low = swings
        .iter()
        .rev()
        .find(|s| s.kind == SwingKind::Low)
        .map(|s| s.price);
    state
}

/// True when a recent CHoCH (within `max_bars_ago`) broke against `side`.
pub fn choch_against(state: &StructureState, side: Side, max_bars_ago: usize) -> bool {
    matches!(
        state.event,
        Some(StructureEvent {
            kind: StructureEventKind::Choch,
            direction,
            bars_ago,
        }) if direction == side.opposite() && bars_ago <= max_bars_ago
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time_ms: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close,
            volume: 1.0,
            complete: true,
        }
    }

    /// Build candles from (high, low, close) triples.
    fn series(points: &[(f64, f64, f64)]) -> Vec<Candle> {
        points.iter().map(|&(h, l, c)| candle(h, l, c)).collect()
    }

    #[test]
    fn swings_need_minimum_bars() {
        let candles = series(&[(10.0, 9.0, 9.5); 3]);
        assert!(find_swings(&candles).is_empty());
    }

    #[test]
    fn fractal_high_and_low_detected() {
        let candles = series(&[
            (10.0, 9.0, 9.5),
            (11.0, 10.0, 10.5),
            (14.0, 11.0, 12.0), // swing high at index 2
            (11.5, 10.5, 11.0),
            (10.5, 9.5, 10.0),
            (9.5, 8.0, 8.5), // swing low candidate at index 5 — needs wings
            (10.0, 8.5, 9.5),
            (10.5, 9.0, 10.0),
        ]);
        let swings = find_swings(&candles);
        assert!(swings
            .iter()
            .any(|s| s.kind == SwingKind::High && s.index == 2 && s.price == 14.0));
        assert!(swings
            .iter()
            .any(|s| s.kind == SwingKind::Low && s.index == 5 && s.price == 8.0));
    }

    #[test]
    fn bos_on_uptrend_continuation() {
        // Rising structure: higher swing highs broken repeatedly.
        let candles = series(&[
            (10.0, 9.0, 9.5),
            (11.0, 10.0, 10.5),
            (12.0, 10.5, 11.0), // swing high 12
            (11.0, 10.0, 10.5),
            (10.8, 9.8, 10.2),
            (11.5, 10.2, 11.0),
            (13.0, 11.0, 12.5), // breaks 12 upward
            (13.5, 12.0, 13.0),
            (14.0, 12.5, 13.5),
        ]);
        let state = analyze(&candles);
        assert_eq!(state.trend, Some(Side::Buy));
        let event = state.event.unwrap();
        assert_eq!(event.direction, Side::Buy);
        assert_eq!(event.kind, StructureEventKind::Bos);
    }

    #[test]
    fn choch_on_reversal_against_uptrend() {
        let candles = series(&[
            (10.0, 9.0, 9.5),
            (11.0, 10.0, 10.5),
            (12.0, 10.5, 11.0), // swing high 12
            (11.0, 10.0, 10.5),
            (10.8, 9.8, 10.2),
            (13.0, 10.2, 12.5), // BOS up: trend = Buy
            (12.5, 10.5, 11.0),
            (11.5, 9.9, 10.1), // swing low forms around 9.9
            (11.0, 10.0, 10.5),
            (10.8, 10.2, 10.4),
            (10.5, 9.0, 9.2), // closes below swing low 9.9 → CHoCH down
        ]);
        let state = analyze(&candles);
        assert_eq!(state.trend, Some(Side::Sell));
        let event = state.event.unwrap();
        assert_eq!(event.kind, StructureEventKind::Choch);
        assert_eq!(event.direction, Side::Sell);
        // CHoCH against a BUY position.
        assert!(choch_against(&state, Side::Buy, 5));
        assert!(!choch_against(&state, Side::Sell, 5));
    }

    #[test]
    fn stale_choch_ignored() {
        let state = StructureState {
            last_swing_high: Some(12.0),
            last_swing_low: Some(9.0),
            trend: Some(Side::Sell),
            event: Some(StructureEvent {
                kind: StructureEventKind::Choch,
                direction: Side::Sell,
                bars_ago: 30,
            }),
        };
        assert!(!choch_against(&state, Side::Buy, 5));
    }
}
