// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing Method
// =============================================================================
//
//   RS  = avg_gain / avg_loss   (Wilder-smoothed over `period`)
//   RSI = 100 - 100 / (1 + RS)
//
// Default period: 14.
// =============================================================================

/// Compute the most recent RSI value.
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// closes, or any intermediate value is non-finite.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = gains / period_f;
    let mut avg_loss = losses / period_f;

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta >= 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }

    if avg_loss <= f64::EPSILON {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_insufficient_data() {
        assert!(calculate_rsi(&[1.0, 2.0], 14).is_none());
        assert!(calculate_rsi(&[], 14).is_none());
    }

    #[test]
    fn rsi_period_zero() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_near_zero() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!(rsi < 1.0, "expected near-zero RSI, got {rsi}");
    }

    #[test]
    fn rsi_alternating_near_50() {
        // Equal-magnitude up/down moves should hover around 50.
        let mut closes = vec![100.0];
        for i in 0..40 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last + 1.0 } else { last - 1.0 });
        }
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((rsi - 50.0).abs() < 10.0, "expected mid-range RSI, got {rsi}");
    }

    #[test]
    fn rsi_bounded() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn rsi_nan_returns_none() {
        let mut closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        closes[20] = f64::NAN;
        assert!(calculate_rsi(&closes, 14).is_none());
    }
}
