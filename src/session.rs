// =============================================================================
// Trading Sessions & News Blackouts
// =============================================================================
//
// Session boundaries are fixed in UTC:
//
//   ASIA     22:00 – 07:00
//   LONDON   07:00 – 12:00
//   OVERLAP  12:00 – 16:00   (London + New York both open)
//   NY       16:00 – 22:00
//
// The Friday caution window (Friday from 15:00 UTC) covers both the London
// close and the pre-weekend liquidity drain; the profit protector treats it
// as a warning signal.
// =============================================================================

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Which major FX session is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionTag {
    Asia,
    London,
    Overlap,
    NewYork,
}

impl std::fmt::Display for SessionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asia => write!(f, "ASIA"),
            Self::London => write!(f, "LONDON"),
            Self::Overlap => write!(f, "OVERLAP"),
            Self::NewYork => write!(f, "NY"),
        }
    }
}

/// Classify a UTC timestamp into its session.
pub fn session_of(ts: DateTime<Utc>) -> SessionTag {
    match ts.hour() {
        7..=11 => SessionTag::London,
        12..=15 => SessionTag::Overlap,
        16..=21 => SessionTag::NewYork,
        _ => SessionTag::Asia,
    }
}

/// Epoch-ms variant of [`session_of`] for wire-level callers.
pub fn session_of_ms(epoch_ms: i64) -> SessionTag {
    let ts = DateTime::<Utc>::from_timestamp_millis(epoch_ms).unwrap_or_else(Utc::now);
    session_of(ts)
}

/// True during the Friday-PM / London-close caution window.
pub fn is_friday_caution(ts: DateTime<Utc>) -> bool {
    ts.weekday() == Weekday::Fri && ts.hour() >= 15
}

/// Start of the UTC trading day containing `ts`, in epoch milliseconds.
/// Used to anchor session VWAP and previous-day high/low lookups.
pub fn day_open_ms(epoch_ms: i64) -> i64 {
    const DAY_MS: i64 = 86_400_000;
    epoch_ms.div_euclid(DAY_MS) * DAY_MS
}

// =============================================================================
// News blackout calendar
// =============================================================================

/// A single scheduled-news blackout window. `symbol` of `None` blacks out
/// every symbol (e.g. NFP, FOMC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsWindow {
    pub label: String,
    #[serde(default)]
    pub symbol: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Blackout calendar fed by the external news collaborator through the API.
/// The engine only reads it; it never scrapes feeds itself.
pub struct NewsCalendar {
    windows: RwLock<Vec<NewsWindow>>,
}

impl NewsCalendar {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(Vec::new()),
        }
    }

    /// Replace the full window list (the collaborator pushes complete sets).
    pub fn replace(&self, windows: Vec<NewsWindow>) {
        info!(count = windows.len(), "news blackout windows replaced");
        *self.windows.write() = windows;
    }

    pub fn add(&self, window: NewsWindow) {
        self.windows.write().push(window);
    }

    /// True when `symbol` is inside any active blackout window at `now_ms`.
    pub fn is_blackout(&self, symbol: &str, now_ms: i64) -> bool {
        self.windows.read().iter().any(|w| {
            now_ms >= w.start_ms
                && now_ms < w.end_ms
                && w.symbol.as_deref().map_or(true, |s| s == symbol)
        })
    }

    /// Drop windows that ended before `now_ms`.
    pub fn prune(&self, now_ms: i64) {
        self.windows.write().retain(|w| w.end_ms > now_ms);
    }

    pub fn snapshot(&self) -> Vec<NewsWindow> {
        self.windows.read().clone()
    }
}

impl Default for NewsCalendar {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn session_boundaries() {
        assert_eq!(session_of(utc(2026, 3, 2, 3, 0)), SessionTag::Asia);
        assert_eq!(session_of(utc(2026, 3, 2, 7, 0)), SessionTag::London);
        assert_eq!(session_of(utc(2026, 3, 2, 11, 59)), SessionTag::London);
        assert_eq!(session_of(utc(2026, 3, 2, 12, 0)), SessionTag::Overlap);
        assert_eq!(session_of(utc(2026, 3, 2, 16, 0)), SessionTag::NewYork);
        assert_eq!(session_of(utc(2026, 3, 2, 22, 0)), SessionTag::Asia);
    }

    #[test]
    fn friday_caution_window() {
        // Friday 2026-03-06.
        assert!(is_friday_caution(utc(2026, 3, 6, 15, 0)));
        assert!(is_friday_caution(utc(2026, 3, 6, 21, 30)));
        assert!(!is_friday_caution(utc(2026, 3, 6, 14, 59)));
        // Thursday.
        assert!(!is_friday_caution(utc(2026, 3, 5, 16, 0)));
    }

    #[test]
    fn day_open_alignment() {
        let ts = utc(2026, 3, 2, 13, 45).timestamp_millis();
        let open = day_open_ms(ts);
        assert_eq!(open % 86_400_000, 0);
        assert!(open <= ts && ts - open < 86_400_000);
    }

    #[test]
    fn blackout_global_and_symbol_scoped() {
        let cal = NewsCalendar::new();
        cal.add(NewsWindow {
            label: "NFP".into(),
            symbol: None,
            start_ms: 1_000,
            end_ms: 2_000,
        });
        cal.add(NewsWindow {
            label: "gold fix".into(),
            symbol: Some("XAUUSD".into()),
            start_ms: 5_000,
            end_ms: 6_000,
        });

        assert!(cal.is_blackout("EURUSD", 1_500));
        assert!(cal.is_blackout("XAUUSD", 1_500));
        assert!(!cal.is_blackout("EURUSD", 5_500));
        assert!(cal.is_blackout("XAUUSD", 5_500));
        assert!(!cal.is_blackout("XAUUSD", 6_000));
    }

    #[test]
    fn prune_drops_expired() {
        let cal = NewsCalendar::new();
        cal.add(NewsWindow {
            label: "old".into(),
            symbol: None,
            start_ms: 0,
            end_ms: 100,
        });
        cal.add(NewsWindow {
            label: "future".into(),
            symbol: None,
            start_ms: 500,
            end_ms: 900,
        });
        cal.prune(200);
        let left = cal.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].label, "future");
    }
}
