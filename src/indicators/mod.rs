// =============================================================================
// Technical indicators — pure functions over candle slices
// =============================================================================
//
// Every function is deterministic: the same slice always produces the same
// output. Values that cannot be computed (short input, non-finite data) are
// `None`, never a zero default.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod features;
pub mod macd;
pub mod patterns;
pub mod profile;
pub mod rsi;
pub mod structure;
pub mod vwap;

pub use features::Features;
