// =============================================================================
// Moving Average Convergence Divergence (MACD 12/26/9)
// =============================================================================

use super::ema::calculate_ema;

/// MACD line, signal line, and histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD(fast, slow, signal) values.
///
/// Returns `None` when there is not enough data for the slow EMA plus the
/// signal smoothing window.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the latest close.
    let len = slow_series.len().min(fast_series.len());
    let fast_tail = &fast_series[fast_series.len() - len..];
    let slow_tail = &slow_series[slow_series.len() - len..];

    let macd_series: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_series.len() < signal {
        return None;
    }

    let signal_series = calculate_ema(&macd_series, signal);
    let macd = *macd_series.last()?;
    let sig = *signal_series.last()?;

    if !macd.is_finite() || !sig.is_finite() {
        return None;
    }

    Some(MacdResult {
        macd,
        signal: sig,
        histogram: macd - sig,
    })
}

/// Standard 12/26/9 configuration.
pub fn calculate(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_none());
    }

    #[test]
    fn macd_bad_periods() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64 * 2.0).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd > 0.0, "uptrend MACD should be positive");
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (1..=100).rev().map(|x| x as f64 * 2.0).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd < 0.0, "downtrend MACD should be negative");
    }

    #[test]
    fn macd_histogram_is_difference() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 8.0)
            .collect();
        let result = calculate(&closes).unwrap();
        assert!((result.histogram - (result.macd - result.signal)).abs() < 1e-12);
    }

    #[test]
    fn macd_flat_series_near_zero() {
        let closes = vec![100.0; 120];
        let result = calculate(&closes).unwrap();
        assert!(result.macd.abs() < 1e-9);
        assert!(result.signal.abs() < 1e-9);
    }
}
