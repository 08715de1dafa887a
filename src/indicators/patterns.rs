// =============================================================================
// Candle Patterns — engulfing, hammer, stars, rejection wicks
// =============================================================================
//
// Pattern checks always read the most recent complete candles of the slice.
// Thresholds follow the usual price-action conventions:
//
//   engulfing  — body > 1.5x prior body, opposite direction
//   hammer     — lower wick > 2x body, small upper wick
//   star       — three-candle reversal with a small-bodied middle candle
//   rejection  — wick > 2x body on the signal side
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;
use crate::types::Side;

/// Recognised single- and multi-candle patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandlePattern {
    BullishEngulfing,
    BearishEngulfing,
    Hammer,
    ShootingStar,
    MorningStar,
    EveningStar,
    RejectionWickUp,
    RejectionWickDown,
}

impl std::fmt::Display for CandlePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BullishEngulfing => "bullish_engulfing",
            Self::BearishEngulfing => "bearish_engulfing",
            Self::Hammer => "hammer",
            Self::ShootingStar => "shooting_star",
            Self::MorningStar => "morning_star",
            Self::EveningStar => "evening_star",
            Self::RejectionWickUp => "rejection_wick_up",
            Self::RejectionWickDown => "rejection_wick_down",
        };
        write!(f, "{name}")
    }
}

const ENGULFING_BODY_RATIO: f64 = 1.5;
const WICK_BODY_RATIO: f64 = 2.0;
const STAR_BODY_FRACTION: f64 = 0.3;

/// Engulfing candle in the *opposite* direction of `side`. Used by the
/// profit protector: a bearish engulfing against a BUY, and vice versa.
pub fn opposite_engulfing(candles: &[Candle], side: Side) -> bool {
    if candles.len() < 2 {
        return false;
    }
    let prev = &candles[candles.len() - 2];
    let last = &candles[candles.len() - 1];

    if prev.body() <= f64::EPSILON {
        return false;
    }
    if last.body() < ENGULFING_BODY_RATIO * prev.body() {
        return false;
    }
    match side {
        Side::Buy => !last.is_bullish() && prev.is_bullish(),
        Side::Sell => last.is_bullish() && !prev.is_bullish(),
    }
}

/// Rejection wick on the latest candle: returns the direction the market
/// rejected (Buy = rejected higher prices via an upper wick).
pub fn rejection_wick(candles: &[Candle]) -> Option<Side> {
    let last = candles.last()?;
    let body = last.body().max(f64::EPSILON);
    if last.upper_wick() > WICK_BODY_RATIO * body && last.upper_wick() > last.lower_wick() {
        return Some(Side::Buy);
    }
    if last.lower_wick() > WICK_BODY_RATIO * body && last.lower_wick() > last.upper_wick() {
        return Some(Side::Sell);
    }
    None
}

/// Detect the strongest pattern on the latest candle(s), if any.
pub fn detect_last(candles: &[Candle]) -> Option<CandlePattern> {
    if let Some(star) = detect_star(candles) {
        return Some(star);
    }
    if candles.len() >= 2 {
        if opposite_engulfing(candles, Side::Buy) {
            return Some(CandlePattern::BearishEngulfing);
        }
        if opposite_engulfing(candles, Side::Sell) {
            return Some(CandlePattern::BullishEngulfing);
        }
    }
    let last = candles.last()?;
    let body = last.body().max(f64::EPSILON);
    if last.lower_wick() > WICK_BODY_RATIO * body && last.upper_wick() < body {
        return Some(CandlePattern::Hammer);
    }
    if last.upper_wick() > WICK_BODY_RATIO * body && last.lower_wick() < body {
        return Some(CandlePattern::ShootingStar);
    }
    match rejection_wick(candles) {
        Some(Side::Buy) => Some(CandlePattern::RejectionWickUp),
        Some(Side::Sell) => Some(CandlePattern::RejectionWickDown),
        None => None,
    }
}

fn detect_star(candles: &[Candle]) -> Option<CandlePattern> {
    if candles.len() < 3 {
        return None;
    }
    let a = &candles[candles.len() - 3];
    let b = &candles[candles.len() - 2];
    let c = &candles[candles.len() - 1];

    let small_middle = b.body() < STAR_BODY_FRACTION * a.body().max(f64::EPSILON);
    if !small_middle {
        return None;
    }

    // Morning star: down candle, pause, strong up candle closing into A's body.
    if !a.is_bullish() && c.is_bullish() && c.close > (a.open + a.close) / 2.0 {
        return Some(CandlePattern::MorningStar);
    }
    // Evening star: mirror image.
    if a.is_bullish() && !c.is_bullish() && c.close < (a.open + a.close) / 2.0 {
        return Some(CandlePattern::EveningStar);
    }
    None
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time_ms: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
            complete: true,
        }
    }

    #[test]
    fn bearish_engulfing_against_long() {
        let candles = vec![
            candle(100.0, 101.2, 99.9, 101.0), // bullish, body 1.0
            candle(101.0, 101.1, 99.0, 99.2),  // bearish, body 1.8
        ];
        assert!(opposite_engulfing(&candles, Side::Buy));
        assert!(!opposite_engulfing(&candles, Side::Sell));
        assert_eq!(detect_last(&candles), Some(CandlePattern::BearishEngulfing));
    }

    #[test]
    fn small_body_not_engulfing() {
        let candles = vec![
            candle(100.0, 101.2, 99.9, 101.0),
            candle(101.0, 101.1, 100.0, 100.2), // body 0.8 < 1.5x
        ];
        assert!(!opposite_engulfing(&candles, Side::Buy));
    }

    #[test]
    fn hammer_detected() {
        // Long lower wick, tiny upper wick.
        let candles = vec![candle(100.0, 100.3, 96.0, 100.2)];
        assert_eq!(detect_last(&candles), Some(CandlePattern::Hammer));
    }

    #[test]
    fn shooting_star_detected() {
        let candles = vec![candle(100.0, 104.0, 99.9, 99.95)];
        let p = detect_last(&candles);
        assert!(
            p == Some(CandlePattern::ShootingStar) || p == Some(CandlePattern::RejectionWickUp),
            "got {p:?}"
        );
    }

    #[test]
    fn rejection_wick_direction() {
        // Strong upper wick: rejected higher prices.
        let up = vec![candle(100.0, 105.0, 99.8, 100.3)];
        assert_eq!(rejection_wick(&up), Some(Side::Buy));

        let down = vec![candle(100.0, 100.2, 95.0, 99.8)];
        assert_eq!(rejection_wick(&down), Some(Side::Sell));

        let balanced = vec![candle(100.0, 101.0, 99.0, 100.5)];
        assert_eq!(rejection_wick(&balanced), None);
    }

    #[test]
    fn morning_star_three_candles() {
        let candles = vec![
            candle(104.0, 104.2, 99.8, 100.0), // strong down
            candle(100.0, 100.4, 99.5, 100.1), // small pause
            candle(100.1, 104.0, 100.0, 103.5), // strong up, closes above midpoint
        ];
        assert_eq!(detect_last(&candles), Some(CandlePattern::MorningStar));
    }

    #[test]
    fn evening_star_three_candles() {
        let candles = vec![
            candle(100.0, 104.2, 99.8, 104.0),
            candle(104.0, 104.5, 103.6, 104.1),
            candle(104.0, 104.1, 100.0, 100.4),
        ];
        assert_eq!(detect_last(&candles), Some(CandlePattern::EveningStar));
    }
}
