// =============================================================================
// Volume Profile — high-volume nodes and liquidity voids
// =============================================================================
//
// The profile buckets traded volume by price over the trailing window.
// A high-volume node (HVN) is the bucket with the most volume — price tends
// to gravitate toward it, which the exit manager uses as a trailing gate.
// A liquidity void is a bucket with volume below `VOID_FRACTION` of the mean;
// price tends to traverse voids quickly.
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;

/// Number of price buckets in the profile.
const BUCKETS: usize = 24;

/// A bucket counts as a void below this fraction of mean bucket volume.
const VOID_FRACTION: f64 = 0.2;

/// A low-volume gap in the profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiquidityVoid {
    pub low: f64,
    pub high: f64,
}

/// Computed volume profile over a candle window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeProfile {
    /// Price at the center of the highest-volume bucket.
    pub hvn_price: f64,
    pub voids: Vec<LiquidityVoid>,
    pub bucket_width: f64,
}

impl VolumeProfile {
    /// Distance from `price` to the high-volume node.
    pub fn hvn_distance(&self, price: f64) -> f64 {
        (price - self.hvn_price).abs()
    }

    /// Distance from `price` to the nearest liquidity void edge, or `None`
    /// when the profile has no voids.
    pub fn nearest_void_distance(&self, price: f64) -> Option<f64> {
        self.voids
            .iter()
            .map(|v| {
                if price < v.low {
                    v.low - price
                } else if price > v.high {
                    price - v.high
                } else {
                    0.0
                }
            })
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Build a volume profile from a candle window. Candle volume is assigned to
/// the bucket containing its typical price.
pub fn build(candles: &[Candle]) -> Option<VolumeProfile> {
    if candles.len() < 10 {
        return None;
    }

    let mut lo = f64::MAX;
    let mut hi = f64::MIN;
    for c in candles {
        lo = lo.min(c.low);
        hi = hi.max(c.high);
    }
    if !lo.is_finite() || !hi.is_finite() || hi <= lo {
        return None;
    }

    let width = (hi - lo) / BUCKETS as f64;
    let mut volumes = [0.0_f64; BUCKETS];
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        let idx = (((typical - lo) / width) as usize).min(BUCKETS - 1);
        volumes[idx] += c.volume;
    }

    let total: f64 = volumes.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mean = total / BUCKETS as f64;

    let (hvn_idx, _) = volumes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let hvn_price = lo + (hvn_idx as f64 + 0.5) * width;

    // Merge adjacent void buckets into ranges.
    let mut voids = Vec::new();
    let mut open: Option<usize> = None;
    for (i, &v) in volumes.iter().enumerate() {
        let is_void = v < VOID_FRACTION * mean;
        match (is_void, open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                voids.push(LiquidityVoid {
                    low: lo + start as f64 * width,
                    high: lo + i as f64 * width,
                });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        voids.push(LiquidityVoid {
            low: lo + start as f64 * width,
            high: hi,
        });
    }

    Some(VolumeProfile {
        hvn_price,
        voids,
        bucket_width: width,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(price: f64, volume: f64) -> Candle {
        Candle {
            open_time_ms: 0,
            open: price,
            high: price + 0.5,
            low: price - 0.5,
            close: price,
            volume,
            complete: true,
        }
    }

    #[test]
    fn profile_needs_data() {
        assert!(build(&[candle(100.0, 1.0); 5]).is_none());
    }

    #[test]
    fn hvn_at_volume_cluster() {
        let mut candles = Vec::new();
        // Thin trade across 100..120, heavy cluster at 110.
        for i in 0..20 {
            candles.push(candle(100.0 + i as f64, 1.0));
        }
        for _ in 0..30 {
            candles.push(candle(110.0, 20.0));
        }
        let profile = build(&candles).unwrap();
        assert!(
            (profile.hvn_price - 110.0).abs() < 2.0,
            "HVN {} should sit near 110",
            profile.hvn_price
        );
        assert!(profile.hvn_distance(112.0) < 4.0);
    }

    #[test]
    fn voids_found_in_gap() {
        let mut candles = Vec::new();
        for _ in 0..30 {
            candles.push(candle(100.0, 10.0));
        }
        for _ in 0..30 {
            candles.push(candle(120.0, 10.0));
        }
        let profile = build(&candles).unwrap();
        // The middle of the range traded nothing.
        assert!(!profile.voids.is_empty());
        let near_mid = profile.nearest_void_distance(110.0).unwrap();
        assert!(near_mid < 2.0, "110 should be inside/near a void, dist {near_mid}");
    }

    #[test]
    fn no_void_distance_when_profile_flat() {
        let candles: Vec<Candle> = (0..40).map(|i| candle(100.0 + (i % 24) as f64, 5.0)).collect();
        let profile = build(&candles).unwrap();
        if profile.voids.is_empty() {
            assert!(profile.nearest_void_distance(105.0).is_none());
        }
    }
}
