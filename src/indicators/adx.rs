// =============================================================================
// Average Directional Index (ADX) with DI+ / DI-
// =============================================================================
//
// Wilder's directional movement system:
//
//   +DM = H_t - H_{t-1}   when it exceeds the down-move and is positive
//   -DM = L_{t-1} - L_t   when it exceeds the up-move and is positive
//   DI± = 100 * smoothed(±DM) / smoothed(TR)
//   DX  = 100 * |DI+ - DI-| / (DI+ + DI-)
//   ADX = Wilder-smoothed DX
//
// Default period: 14.
// =============================================================================

use crate::market_data::Candle;

/// ADX value together with its directional components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxResult {
    pub adx: f64,
    pub di_plus: f64,
    pub di_minus: f64,
}

/// Compute the most recent ADX / DI+ / DI-.
///
/// Requires at least `2 * period + 1` candles so that the DX series has
/// `period` values to smooth; returns `None` otherwise.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxResult> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for i in 1..candles.len() {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;

        plus_dms.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dms.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });

        let hl = candles[i].high - candles[i].low;
        let hc = (candles[i].high - candles[i - 1].close).abs();
        let lc = (candles[i].low - candles[i - 1].close).abs();
        trs.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;

    // Wilder-smoothed running sums.
    let mut tr_s: f64 = trs[..period].iter().sum();
    let mut plus_s: f64 = plus_dms[..period].iter().sum();
    let mut minus_s: f64 = minus_dms[..period].iter().sum();

    let mut dx_values = Vec::new();
    let mut di_plus = 0.0;
    let mut di_minus = 0.0;

    for i in period..trs.len() {
        tr_s = tr_s - tr_s / period_f + trs[i];
        plus_s = plus_s - plus_s / period_f + plus_dms[i];
        minus_s = minus_s - minus_s / period_f + minus_dms[i];

        if tr_s <= f64::EPSILON {
            continue;
        }
        di_plus = 100.0 * plus_s / tr_s;
        di_minus = 100.0 * minus_s / tr_s;

        let di_sum = di_plus + di_minus;
        if di_sum > f64::EPSILON {
            dx_values.push(100.0 * (di_plus - di_minus).abs() / di_sum);
        }
    }

    if dx_values.is_empty() {
        return None;
    }

    // ADX: Wilder smoothing over the DX series.
    let seed_len = dx_values.len().min(period);
    let mut adx: f64 = dx_values[..seed_len].iter().sum::<f64>() / seed_len as f64;
    for &dx in &dx_values[seed_len..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    if !adx.is_finite() || !di_plus.is_finite() || !di_minus.is_finite() {
        return None;
    }

    Some(AdxResult {
        adx,
        di_plus,
        di_minus,
    })
}
