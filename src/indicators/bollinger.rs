// =============================================================================
// Bollinger Bands (20, 2) with width
// =============================================================================
//
//   middle = SMA(period)
//   upper  = middle + k * stddev
//   lower  = middle - k * stddev
//   width  = 100 * (upper - lower) / middle
//
// Width is expressed as a percentage of the middle band so it is comparable
// across price scales.
// =============================================================================

/// Bands for the most recent close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band.
    pub width: f64,
}

/// Compute the most recent Bollinger Bands.
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let mean: f64 = window.iter().sum::<f64>() / period as f64;
    let variance: f64 = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();

    if !mean.is_finite() || !sd.is_finite() || mean.abs() < f64::EPSILON {
        return None;
    }

    let upper = mean + k * sd;
    let lower = mean - k * sd;
    let width = 100.0 * (upper - lower) / mean;

    Some(BollingerResult {
        upper,
        middle: mean,
        lower,
        width: width.abs(),
    })
}

/// Median band width over the trailing `samples` windows. Used by the regime
/// classifier to compare the current width against recent history.
pub fn width_median(closes: &[f64], period: usize, k: f64, samples: usize) -> Option<f64> {
    if samples == 0 || closes.len() < period + samples - 1 {
        return None;
    }

    let mut widths = Vec::with_capacity(samples);
    for i in 0..samples {
        let end = closes.len() - i;
        let result = calculate_bollinger(&closes[..end], period, k)?;
        widths.push(result.width);
    }

    widths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = widths.len() / 2;
    let median = if widths.len() % 2 == 0 {
        (widths[mid - 1] + widths[mid]) / 2.0
    } else {
        widths[mid]
    };
    median.is_finite().then_some(median)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_series_zero_width() {
        let closes = vec![100.0; 30];
        let result = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((result.upper - 100.0).abs() < 1e-9);
        assert!((result.lower - 100.0).abs() < 1e-9);
        assert!(result.width < 1e-9);
    }

    #[test]
    fn bollinger_band_ordering() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 5.0)
            .collect();
        let result = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(result.upper > result.middle);
        assert!(result.middle > result.lower);
        assert!(result.width > 0.0);
    }

    #[test]
    fn bollinger_width_scales_with_volatility() {
        let quiet: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 1.0)
            .collect();
        let wild: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 8.0)
            .collect();
        let w_quiet = calculate_bollinger(&quiet, 20, 2.0).unwrap().width;
        let w_wild = calculate_bollinger(&wild, 20, 2.0).unwrap().width;
        assert!(w_wild > 4.0 * w_quiet);
    }

    #[test]
    fn width_median_tracks_history() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.4).sin() * 3.0)
            .collect();
        let median = width_median(&closes, 20, 2.0, 20).unwrap();
        let current = calculate_bollinger(&closes, 20, 2.0).unwrap().width;
        // Stationary series: current width should sit near the median.
        assert!(current < median * 2.0 && current > median * 0.5);
    }

    #[test]
    fn width_median_insufficient_data() {
        let closes = vec![100.0; 25];
        assert!(width_median(&closes, 20, 2.0, 20).is_none());
    }
}
