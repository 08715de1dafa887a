// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// The true range of a bar stretches its high-low span to swallow any gap
// from the previous close:
//
//   tr = max(high, prev_close) - min(low, prev_close)
//
// Wilder smoothing then folds each new true range into the running value
// with weight 1/period, seeded from the average of the first `period` bars.
// =============================================================================

use crate::market_data::Candle;

/// True range of `bar` given the close of the bar before it.
fn true_range(bar: &Candle, prev_close: f64) -> f64 {
    // f64::max/min would quietly discard a NaN operand; a corrupt bar must
    // poison the result instead.
    if !(bar.high.is_finite() && bar.low.is_finite() && prev_close.is_finite()) {
        return f64::NAN;
    }
    bar.high.max(prev_close) - bar.low.min(prev_close)
}

/// Compute the most recent ATR value over `candles` (oldest first).
///
/// Needs `period + 1` bars (each true range consumes the previous close);
/// returns `None` on short input, a zero period, or corrupt data.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() <= period {
        return None;
    }

    let mut ranges = candles
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close));

    let mut smoothed = 0.0;
    for _ in 0..period {
        smoothed += ranges.next()?;
    }
    smoothed /= period as f64;

    let carry = (period as f64 - 1.0) / period as f64;
    for tr in ranges {
        smoothed = smoothed * carry + tr / period as f64;
    }

    smoothed.is_finite().then_some(smoothed)
}

/// ATR over a longer baseline window, used as the volatility-regime
/// denominator (`ATR / ATR_baseline`).
pub fn atr_ratio(candles: &[Candle], period: usize, baseline: usize) -> Option<f64> {
    let current = calculate_atr(candles, period)?;
    let base = calculate_atr(candles, baseline)?;
    if base <= 0.0 {
        return None;
    }
    let ratio = current / base;
    ratio.is_finite().then_some(ratio)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
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

    /// Gapless bars of constant span `width` centred on `mid`.
    fn steady(mid: f64, width: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|_| bar(mid + width / 2.0, mid - width / 2.0, mid))
            .collect()
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(calculate_atr(&steady(50.0, 4.0, 20), 0).is_none());
    }

    #[test]
    fn needs_one_bar_more_than_the_period() {
        let candles = steady(50.0, 4.0, 5);
        assert!(calculate_atr(&candles, 5).is_none());
        let candles = steady(50.0, 4.0, 6);
        assert!(calculate_atr(&candles, 5).is_some());
    }

    #[test]
    fn steady_tape_reads_its_own_span() {
        // No gaps, every bar spans exactly 4.0: the ATR is exactly 4.0.
        let atr = calculate_atr(&steady(50.0, 4.0, 25), 7).unwrap();
        assert!((atr - 4.0).abs() < 1e-9, "got {atr}");
    }

    #[test]
    fn overnight_gap_counts_toward_the_range() {
        // Close at 50, then a tight bar stranded up at 58..60: its true
        // range is 10 (gap included), not the bare 2-point span.
        let mut candles = steady(50.0, 2.0, 10);
        candles.push(bar(60.0, 58.0, 59.0));
        let atr = calculate_atr(&candles, 4).unwrap();
        assert!(atr > 2.0, "gap must widen the ATR, got {atr}");
    }

    #[test]
    fn single_spike_decays_instead_of_sticking() {
        let mut candles = steady(100.0, 3.0, 8);
        candles.push(bar(115.0, 85.0, 100.0)); // one 30-point shock
        candles.extend(steady(100.0, 3.0, 8));
        let atr = calculate_atr(&candles, 5).unwrap();
        // Above the quiet span, but well below the shock itself.
        assert!(atr > 3.0 && atr < 20.0, "got {atr}");
    }

    #[test]
    fn corrupt_bar_poisons_the_result() {
        let mut candles = steady(50.0, 4.0, 10);
        candles[6].low = f64::NAN;
        assert!(calculate_atr(&candles, 4).is_none());
    }

    #[test]
    fn atr_ratio_detects_expansion() {
        // Quiet history, then a volatile tail: short ATR above long ATR.
        let mut candles = Vec::new();
        for i in 0..60 {
            let base = 100.0 + i as f64 * 0.01;
            candles.push(bar(base + 1.0, base - 1.0, base));
        }
        for i in 0..10 {
            let base = 101.0 + i as f64 * 0.01;
            candles.push(bar(base + 6.0, base - 6.0, base));
        }
        let ratio = atr_ratio(&candles, 14, 50).unwrap();
        assert!(ratio > 1.3, "expected expansion ratio, got {ratio}");
    }
}
