// =============================================================================
// Features — the typed per-timeframe indicator record
// =============================================================================
//
// Every field that may be unavailable is an Option; a consumer that needs a
// missing field must skip or degrade, never read a silent zero.
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;
use crate::session::day_open_ms;

use super::adx::{calculate_adx, AdxResult};
use super::atr::{atr_ratio, calculate_atr};
use super::bollinger::{calculate_bollinger, width_median, BollingerResult};
use super::ema::{ema_slope, ema_stack_aligned, latest_ema};
use super::macd::{calculate as calculate_macd, MacdResult};
use super::patterns::{detect_last, CandlePattern};
use super::profile::{build as build_profile, VolumeProfile};
use super::rsi::calculate_rsi;
use super::structure::{analyze as analyze_structure, StructureState};
use super::vwap::{previous_day_high_low, session_high_low, session_vwap, VwapResult, VwapZone};

/// ATR baseline window for the volatility-regime ratio.
const ATR_BASELINE: usize = 50;

/// Typed indicator vector for one (symbol, timeframe) frame.
#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub last_close: Option<f64>,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    pub ema50_slope: Option<f64>,
    pub ema200_slope: Option<f64>,
    /// Some(true) = bullish 20>50>200 stack, Some(false) = bearish, None = mixed.
    pub ema_aligned: Option<bool>,
    pub rsi14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adx: Option<AdxSummary>,
    pub atr14: Option<f64>,
    /// ATR(14) / ATR(50) expansion ratio.
    pub atr_expansion: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<MacdSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bollinger: Option<BollingerSummary>,
    pub bb_width_median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<VwapSummary>,
    pub session_high: Option<f64>,
    pub session_low: Option<f64>,
    pub pdh: Option<f64>,
    pub pdl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<CandlePattern>,
    pub structure: StructureState,
    pub hvn_price: Option<f64>,
    pub nearest_void_distance: Option<f64>,
    /// Injected from the order-flow tracker; `None` when flow is too thin.
    pub flow_imbalance: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdxSummary {
    pub adx: f64,
    pub di_plus: f64,
    pub di_minus: f64,
}

impl From<AdxResult> for AdxSummary {
    fn from(r: AdxResult) -> Self {
        Self {
            adx: r.adx,
            di_plus: r.di_plus,
            di_minus: r.di_minus,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MacdSummary {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl From<MacdResult> for MacdSummary {
    fn from(r: MacdResult) -> Self {
        Self {
            macd: r.macd,
            signal: r.signal,
            histogram: r.histogram,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BollingerSummary {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

impl From<BollingerResult> for BollingerSummary {
    fn from(r: BollingerResult) -> Self {
        Self {
            upper: r.upper,
            middle: r.middle,
            lower: r.lower,
            width: r.width,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VwapSummary {
    pub vwap: f64,
    pub upper_1: f64,
    pub lower_1: f64,
    pub upper_2: f64,
    pub lower_2: f64,
    pub zone: VwapZone,
}

impl From<VwapResult> for VwapSummary {
    fn from(r: VwapResult) -> Self {
        Self {
            vwap: r.vwap,
            upper_1: r.upper_1,
            lower_1: r.lower_1,
            upper_2: r.upper_2,
            lower_2: r.lower_2,
            zone: r.zone,
        }
    }
}

impl Features {
    /// Compute the full vector from complete candles (oldest first).
    /// `flow_imbalance` comes from the order-flow tracker; the rest derives
    /// from the slice alone, deterministically.
    pub fn compute(candles: &[Candle], flow_imbalance: Option<f64>) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last_close = closes.last().copied();
        let anchor = candles
            .last()
            .map(|c| day_open_ms(c.open_time_ms))
            .unwrap_or(0);

        let vwap = last_close.and_then(|price| session_vwap(candles, anchor, price));
        let session_hl = session_high_low(candles, anchor);
        let pd_hl = previous_day_high_low(candles, anchor);
        let volume_profile: Option<VolumeProfile> = build_profile(candles);

        Self {
            last_close,
            ema20: latest_ema(&closes, 20),
            ema50: latest_ema(&closes, 50),
            ema200: latest_ema(&closes, 200),
            ema50_slope: ema_slope(&closes, 50, 5),
            ema200_slope: ema_slope(&closes, 200, 5),
            ema_aligned: ema_stack_aligned(&closes),
            rsi14: calculate_rsi(&closes, 14),
            adx: calculate_adx(candles, 14).map(Into::into),
            atr14: calculate_atr(candles, 14),
            atr_expansion: atr_ratio(candles, 14, ATR_BASELINE),
            macd: calculate_macd(&closes).map(Into::into),
            bollinger: calculate_bollinger(&closes, 20, 2.0).map(Into::into),
            bb_width_median: width_median(&closes, 20, 2.0, 20),
            vwap: vwap.map(Into::into),
            session_high: session_hl.map(|(h, _)| h),
            session_low: session_hl.map(|(_, l)| l),
            pdh: pd_hl.map(|(h, _)| h),
            pdl: pd_hl.map(|(_, l)| l),
            pattern: detect_last(candles),
            structure: analyze_structure(candles),
            hvn_price: volume_profile.as_ref().map(|p| p.hvn_price),
            nearest_void_distance: last_close
                .and_then(|p| volume_profile.as_ref().and_then(|vp| vp.nearest_void_distance(p))),
            flow_imbalance,
        }
    }

    /// An empty record for frames with no data yet.
    pub fn unavailable() -> Self {
        Self {
            last_close: None,
            ema20: None,
            ema50: None,
            ema200: None,
            ema50_slope: None,
            ema200_slope: None,
            ema_aligned: None,
            rsi14: None,
            adx: None,
            atr14: None,
            atr_expansion: None,
            macd: None,
            bollinger: None,
            bb_width_median: None,
            vwap: None,
            session_high: None,
            session_low: None,
            pdh: None,
            pdl: None,
            pattern: None,
            structure: StructureState {
                last_swing_high: None,
                last_swing_low: None,
                trend: None,
                event: None,
            },
            hvn_price: None,
            nearest_void_distance: None,
            flow_imbalance: None,
        }
    }

    /// Normalized distance of price from EMA200 in ATR units (stretch / RMAG).
    pub fn ema200_stretch_atr(&self) -> Option<f64> {
        let price = self.last_close?;
        let ema = self.ema200?;
        let atr = self.atr14?;
        if atr <= 0.0 {
            return None;
        }
        Some((price - ema) / atr)
    }

    /// Look up a named scalar feature for template requirement checks.
    pub fn lookup(&self, name: &str) -> Option<f64> {
        match name {
            "ema_20" => self.ema20,
            "ema_50" => self.ema50,
            "ema_200" => self.ema200,
            "rsi_14" => self.rsi14,
            "adx_14" => self.adx.map(|a| a.adx),
            "atr_14" => self.atr14,
            "atr_expansion" => self.atr_expansion,
            "macd" => self.macd.map(|m| m.macd),
            "bb_width" => self.bollinger.map(|b| b.width),
            "vwap_session" => self.vwap.map(|v| v.vwap),
            "session_high" => self.session_high,
            "session_low" => self.session_low,
            "pdh" => self.pdh,
            "pdl" => self.pdl,
            "flow_imbalance" => self.flow_imbalance,
            _ => None,
        }
    }
}
