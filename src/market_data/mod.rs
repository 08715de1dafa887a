// =============================================================================
// Market data — ticks, candles, rings, aggregation, order flow, snapshots
// =============================================================================

pub mod aggregator;
pub mod order_flow;
pub mod ring;
pub mod snapshot;
pub mod streamer;

pub use ring::MarketRings;
pub use snapshot::{FrameView, Snapshot};
pub use streamer::SnapshotHub;

use serde::{Deserialize, Serialize};

/// A single bid/ask quote from the broker terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub epoch_ms: i64,
    pub bid: f64,
    pub ask: f64,
    /// Last traded price, when the feed reports one.
    #[serde(default)]
    pub last: Option<f64>,
    /// Tick volume, when the feed reports one.
    #[serde(default)]
    pub volume: Option<f64>,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// A single OHLCV candle. Symbol and timeframe are carried by the
/// [`CandleKey`] the candle is stored under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Epoch milliseconds of the candle open (UTC boundary aligned).
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// False while the candle is still forming.
    pub complete: bool,
}

impl Candle {
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.close.max(self.open)
    }

    pub fn lower_wick(&self) -> f64 {
        self.close.min(self.open) - self.low
    }
}

/// Chart timeframes the engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
    ];

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
        }
    }

    /// Feature refresh cadence for this timeframe, in seconds.
    pub fn refresh_secs(self) -> u64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 | Self::M30 => 30,
            Self::H1 => 300,
            Self::H4 => 900,
        }
    }

    /// A frame is stale once its newest complete candle is older than twice
    /// the candle duration plus one refresh interval.
    pub fn staleness_budget_ms(self) -> i64 {
        2 * self.duration_ms() + (self.refresh_secs() as i64) * 1_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "M1"),
            Self::M5 => write!(f, "M5"),
            Self::M15 => write!(f, "M15"),
            Self::M30 => write!(f, "M30"),
            Self::H1 => write!(f, "H1"),
            Self::H4 => write!(f, "H4"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" => Ok(Self::M1),
            "M5" => Ok(Self::M5),
            "M15" => Ok(Self::M15),
            "M30" => Ok(Self::M30),
            "H1" => Ok(Self::H1),
            "H4" => Ok(Self::H4),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_mid_and_spread() {
        let t = Tick {
            symbol: "EURUSD".into(),
            epoch_ms: 0,
            bid: 1.1000,
            ask: 1.1002,
            last: None,
            volume: None,
        };
        assert!((t.mid() - 1.1001).abs() < 1e-12);
        assert!((t.spread() - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn candle_anatomy() {
        let c = Candle {
            open_time_ms: 0,
            open: 10.0,
            high: 15.0,
            low: 8.0,
            close: 12.0,
            volume: 1.0,
            complete: true,
        };
        assert!((c.body() - 2.0).abs() < 1e-12);
        assert!((c.range() - 7.0).abs() < 1e-12);
        assert!((c.upper_wick() - 3.0).abs() < 1e-12);
        assert!((c.lower_wick() - 2.0).abs() < 1e-12);
        assert!(c.is_bullish());
    }

    #[test]
    fn timeframe_durations() {
        assert_eq!(Timeframe::M1.duration_ms(), 60_000);
        assert_eq!(Timeframe::H4.duration_ms(), 4 * 3_600_000);
        assert_eq!("m15".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert!("M7".parse::<Timeframe>().is_err());
    }

    #[test]
    fn candle_key_display() {
        let key = CandleKey::new("XAUUSD", Timeframe::H1);
        assert_eq!(key.to_string(), "XAUUSD@H1");
    }
}
