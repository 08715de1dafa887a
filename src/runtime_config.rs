// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so the engine can be reconfigured at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Hot-reload watches the file's
// mtime and swaps the shared config in place when an external writer
// replaces it atomically.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "XAUUSD".to_string(),
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "BTCUSD".to_string(),
    ]
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:6542".to_string()
}

fn default_api_bind() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_breakeven_pct() -> f64 {
    0.25
}

fn default_partial_pct() -> f64 {
    0.50
}

fn default_partial_close_fraction() -> f64 {
    0.50
}

fn default_trailing_atr_mult() -> f64 {
    1.5
}

fn default_vix_threshold() -> f64 {
    20.0
}

fn default_early_exit_r() -> f64 {
    -0.8
}

fn default_risk_score_threshold() -> f64 {
    0.65
}

fn default_spread_atr_cap() -> f64 {
    0.40
}

fn default_retry_max() -> u32 {
    3
}

fn default_backoff_ms() -> String {
    "300,600,900".to_string()
}

fn default_risk_per_trade_pct() -> f64 {
    0.5
}

fn default_account_equity() -> f64 {
    10_000.0
}

fn default_volume_cap_metals_crypto() -> f64 {
    0.02
}

fn default_volume_cap_majors() -> f64 {
    0.04
}

fn default_volume_cap_crosses() -> f64 {
    0.03
}

fn default_magic() -> u64 {
    902_117
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Operational modes ---------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbols & transport -------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Broker-specific symbol suffix, stripped at the boundary (often empty).
    #[serde(default)]
    pub symbol_suffix: String,

    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Best-effort notification sink; `None` disables outbound pushes.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_api_bind")]
    pub api_bind: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // --- Exit management -----------------------------------------------------
    /// Fraction of distance-to-TP at which breakeven arms (band 0.20–0.30).
    #[serde(default = "default_breakeven_pct")]
    pub breakeven_pct: f64,

    /// Fraction of distance-to-TP at which the partial fires (band 0.40–0.60).
    #[serde(default = "default_partial_pct")]
    pub partial_pct: f64,

    /// Fraction of volume closed on partial (skipped below 0.02 lots).
    #[serde(default = "default_partial_close_fraction")]
    pub partial_close_fraction: f64,

    #[serde(default = "default_true")]
    pub trailing_enabled: bool,

    /// Trailing distance in ATR multiples.
    #[serde(default = "default_trailing_atr_mult")]
    pub trailing_distance_atr_mult: f64,

    /// Volatility index level above which the SL is pre-widened once.
    #[serde(default = "default_vix_threshold")]
    pub vix_threshold: f64,

    // --- Loss cutter ---------------------------------------------------------
    #[serde(default = "default_early_exit_r")]
    pub early_exit_r: f64,

    #[serde(default = "default_risk_score_threshold")]
    pub risk_score_threshold: f64,

    /// Refuse to close while spread/ATR exceeds this cap.
    #[serde(default = "default_spread_atr_cap")]
    pub spread_atr_cap: f64,

    // --- Order gateway -------------------------------------------------------
    #[serde(default = "default_retry_max")]
    pub pos_close_retry_max: u32,

    /// Comma-separated backoff schedule in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub pos_close_backoff_ms: String,

    /// Percent of equity risked per trade for default sizing.
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,

    /// Equity snapshot for sizing; refreshed by reconciliation.
    #[serde(default = "default_account_equity")]
    pub account_equity: f64,

    #[serde(default = "default_volume_cap_metals_crypto")]
    pub volume_cap_metals_crypto: f64,

    #[serde(default = "default_volume_cap_majors")]
    pub volume_cap_majors: f64,

    #[serde(default = "default_volume_cap_crosses")]
    pub volume_cap_crosses: f64,

    /// Order magic number identifying this engine's trades.
    #[serde(default = "default_magic")]
    pub magic: u64,

    // --- Lifecycle flags -----------------------------------------------------
    /// Attach an exit rule automatically when a new position appears.
    #[serde(default = "default_true")]
    pub auto_enable_exit_rules: bool,

    /// Adopt broker positions this engine did not open.
    #[serde(default)]
    pub adopt_untracked_positions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults always deserialise")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (tmp then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Parsed retry backoff schedule. Malformed entries are skipped.
    pub fn backoff_schedule(&self) -> Vec<u64> {
        let parsed: Vec<u64> = self
            .pos_close_backoff_ms
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if parsed.is_empty() {
            vec![300, 600, 900]
        } else {
            parsed
        }
    }

    /// Per-symbol volume cap by asset class.
    pub fn volume_cap(&self, symbol: &str) -> f64 {
        const MAJORS: [&str; 7] = [
            "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD",
        ];
        if symbol.contains("BTC") || symbol.contains("XAU") {
            self.volume_cap_metals_crypto
        } else if MAJORS.contains(&symbol) {
            self.volume_cap_majors
        } else {
            self.volume_cap_crosses
        }
    }
}

// =============================================================================
// Hot reload
// =============================================================================

/// Poll the config file's mtime and swap the shared config when an external
/// writer replaces the file. Runs until the process exits.
pub async fn watch_config(path: PathBuf, shared: Arc<RwLock<EngineConfig>>) {
    let mut last_mtime: Option<SystemTime> = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
    let mut poll = tokio::time::interval(tokio::time::Duration::from_secs(2));

    loop {
        poll.tick().await;
        let Ok(mtime) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
            continue;
        };
        if last_mtime == Some(mtime) {
            continue;
        }
        last_mtime = Some(mtime);

        match EngineConfig::load(&path) {
            Ok(mut fresh) => {
                // Operational modes are owned by the API, not the file.
                let current = shared.read().clone();
                fresh.trading_mode = current.trading_mode;
                fresh.account_mode = current.account_mode;
                *shared.write() = fresh;
                info!(path = %path.display(), "engine config hot-reloaded");
            }
            Err(e) => {
                warn!(error = %e, "config hot-reload failed — keeping current settings");
            }
        }
    }
}
