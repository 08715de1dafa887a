// =============================================================================
// Persistence — atomic JSON stores, append-only event log, writer task
// =============================================================================
//
// Every durable mutation goes through an atomic tmp + rename, the same
// pattern the runtime config uses. Exit rules, OCO pairs, and plans each get
// a keyed store file; events append to a JSON-lines log.
//
// One writer task owns all file I/O for events, batching up to
// `BATCH_LIMIT` records or `BATCH_WINDOW` of accumulation per write, and
// forwards action-lane events to the webhook sink best-effort.
// =============================================================================

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::broker::Position;
use crate::events::{EventClass, EventReceivers, EventRecord};
use crate::exit::rule::ExitRule;
use crate::runtime_config::EngineConfig;

/// Writer flushes at this many buffered records…
const BATCH_LIMIT: usize = 100;

/// …or when this window elapses with anything buffered.
const BATCH_WINDOW: Duration = Duration::from_millis(150);

// =============================================================================
// Keyed JSON store
// =============================================================================

/// A whole-map JSON store with atomic replace semantics.
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> JsonStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Persist the full keyed map (tmp then rename).
    pub fn save(&self, records: &HashMap<String, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = serde_json::to_string_pretty(records)
            .context("failed to serialise store records")?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = records.len(), "store saved");
        Ok(())
    }

    /// Load the map; a missing file is an empty store, not an error.
    pub fn load(&self) -> Result<HashMap<String, T>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }
}

// =============================================================================
// Event log
// =============================================================================

/// Append-only JSON-lines event log.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append_batch(&self, records: &[EventRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(buffer.as_bytes())
            .context("failed to append event batch")?;
        Ok(())
    }
}

// =============================================================================
// Writer task
// =============================================================================

/// Drain both event lanes, batch them into the log, and push action events
/// to the webhook sink. Runs until both senders are gone.
pub async fn run_event_writer(
    mut receivers: EventReceivers,
    log: EventLog,
    config: std::sync::Arc<parking_lot::RwLock<EngineConfig>>,
) {
    info!("event writer task started");
    let http = reqwest::Client::new();
    let mut buffer: Vec<EventRecord> = Vec::with_capacity(BATCH_LIMIT);
    let mut flush_tick = interval(BATCH_WINDOW);
    let mut action_open = true;
    let mut context_open = true;

    loop {
        tokio::select! {
            maybe = receivers.action_rx.recv(), if action_open => {
                match maybe {
                    Some(record) => {
                        notify_webhook(&http, &config, &record);
                        buffer.push(record);
                    }
                    None => action_open = false,
                }
            }
            maybe = receivers.context_rx.recv(), if context_open => {
                match maybe {
                    Some(record) => buffer.push(record),
                    None => context_open = false,
                }
            }
            _ = flush_tick.tick() => {
                if !buffer.is_empty() {
                    if let Err(e) = log.append_batch(&buffer) {
                        warn!(error = %e, "event batch write failed");
                    }
                    buffer.clear();
                }
                if !action_open && !context_open {
                    info!("event writer: all senders gone — final flush done");
                    return;
                }
            }
        }

        if buffer.len() >= BATCH_LIMIT {
            if let Err(e) = log.append_batch(&buffer) {
                warn!(error = %e, "event batch write failed");
            }
            buffer.clear();
        }
    }
}

/// Fire-and-forget webhook push for action events. Failures never block.
fn notify_webhook(
    http: &reqwest::Client,
    config: &std::sync::Arc<parking_lot::RwLock<EngineConfig>>,
    record: &EventRecord,
) {
    if record.class != EventClass::Action {
        return;
    }
    let Some(url) = config.read().webhook_url.clone() else {
        return;
    };
    let Ok(payload) = serde_json::to_value(record) else {
        return;
    };
    let http = http.clone();
    tokio::spawn(async move {
        if let Err(e) = http.post(&url).json(&payload).send().await {
            debug!(error = %e, "webhook push failed (best-effort)");
        }
    });
}

// =============================================================================
// Startup reconcile
// =============================================================================

/// What the startup reconcile changed.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Exit rules whose position no longer exists.
    pub retired: Vec<u64>,
    /// Live positions adopted with a fresh exit rule.
    pub adopted: Vec<u64>,
}

/// Heal persisted exit-rule state against the live broker book.
///
/// Orphan rules (no live position) are retired. Untracked positions gain a
/// rule when they carry this engine's magic, or — with
/// `adopt_untracked_positions` — unconditionally.
pub fn reconcile_exit_rules(
    rules: &mut HashMap<u64, ExitRule>,
    live: &[Position],
    config: &EngineConfig,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let live_tickets: std::collections::HashSet<u64> = live.iter().map(|p| p.ticket).collect();
    let orphans: Vec<u64> = rules
        .keys()
        .copied()
        .filter(|t| !live_tickets.contains(t))
        .collect();
    for ticket in orphans {
        if let Some(mut rule) = rules.remove(&ticket) {
            rule.mark_closed();
            info!(ticket, "orphan exit rule retired");
            outcome.retired.push(ticket);
        }
    }

    for position in live {
        if rules.contains_key(&position.ticket) {
            continue;
        }
        let ours = position.magic == config.magic;
        if !ours && !config.adopt_untracked_positions {
            continue;
        }
        let (Some(sl), Some(tp)) = (position.sl, position.tp) else {
            warn!(
                ticket = position.ticket,
                "cannot adopt position without SL/TP"
            );
            continue;
        };
        let rule = ExitRule::new(
            position.ticket,
            position.symbol.clone(),
            position.side,
            position.entry_price,
            sl,
            tp,
            config.breakeven_pct,
            config.partial_pct,
            config.partial_close_fraction,
            config.trailing_enabled,
            config.trailing_distance_atr_mult,
            config.vix_threshold,
        );
        info!(ticket = position.ticket, ours, "position adopted with exit rule");
        rules.insert(position.ticket, rule);
        outcome.adopted.push(position.ticket);
    }

    outcome
}

/// Persist a ticket-keyed rule map through a string-keyed store.
pub fn save_exit_rules(store: &JsonStore<ExitRule>, rules: &HashMap<u64, ExitRule>) -> Result<()> {
    let keyed: HashMap<String, ExitRule> = rules
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    store.save(&keyed)
}

/// Load a ticket-keyed rule map, skipping unparseable keys.
pub fn load_exit_rules(store: &JsonStore<ExitRule>) -> Result<HashMap<u64, ExitRule>> {
    Ok(store
        .load()?
        .into_iter()
        .filter_map(|(k, v)| k.parse::<u64>().ok().map(|t| (t, v)))
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::ExitState;
    use crate::types::Side;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("meridian-persist-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn rule(ticket: u64) -> ExitRule {
        ExitRule::new(
            ticket, "XAUUSD", Side::Buy, 2450.0, 2446.0, 2458.0,
            0.25, 0.50, 0.50, true, 1.5, 20.0,
        )
    }

    fn position(ticket: u64, magic: u64) -> Position {
        Position {
            ticket,
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            volume: 0.02,
            entry_price: 2450.0,
            sl: Some(2446.0),
            tp: Some(2458.0),
            opened_at_ms: 0,
            magic,
        }
    }

    #[test]
    fn store_roundtrip_and_atomicity() {
        let dir = temp_dir();
        let store: JsonStore<ExitRule> = JsonStore::new(dir.join("exit_rules.json"));

        let mut rules = HashMap::new();
        rules.insert(11u64, rule(11));
        rules.insert(12u64, rule(12));
        save_exit_rules(&store, &rules).unwrap();

        let loaded = load_exit_rules(&store).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&11].ticket, 11);
        assert!(!dir.join("exit_rules.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = temp_dir();
        let store: JsonStore<ExitRule> = JsonStore::new(dir.join("nope.json"));
        assert!(store.load().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn event_log_appends_json_lines() {
        let dir = temp_dir();
        let log = EventLog::new(dir.join("events.log"));

        let records = vec![
            EventRecord::action("exit", "sl_moved").with_ticket(1),
            EventRecord::action("oco", "pair_triggered").with_symbol("XAUUSD"),
        ];
        log.append_batch(&records).unwrap();
        log.append_batch(&records).unwrap();

        let content = std::fs::read_to_string(dir.join("events.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("kind").is_some());
            assert!(value.get("ts_ms").is_some());
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reconcile_retires_orphans() {
        let config = EngineConfig::default();
        let mut rules = HashMap::new();
        rules.insert(11u64, rule(11));
        rules.insert(12u64, rule(12));

        let live = vec![position(12, config.magic)];
        let outcome = reconcile_exit_rules(&mut rules, &live, &config);

        assert_eq!(outcome.retired, vec![11]);
        assert!(!rules.contains_key(&11));
        assert!(rules.contains_key(&12));
    }

    #[test]
    fn reconcile_adopts_own_magic_only_by_default() {
        let config = EngineConfig::default();
        let mut rules = HashMap::new();

        let live = vec![position(21, config.magic), position(22, 555)];
        let outcome = reconcile_exit_rules(&mut rules, &live, &config);

        assert_eq!(outcome.adopted, vec![21]);
        assert!(rules.contains_key(&21));
        assert!(!rules.contains_key(&22));
        assert_eq!(rules[&21].state, ExitState::Init);
    }

    #[test]
    fn reconcile_adopts_foreign_when_configured() {
        let mut config = EngineConfig::default();
        config.adopt_untracked_positions = true;
        let mut rules = HashMap::new();

        let live = vec![position(31, 999)];
        let outcome = reconcile_exit_rules(&mut rules, &live, &config);
        assert_eq!(outcome.adopted, vec![31]);
    }

    #[test]
    fn reconcile_skips_positions_without_stops() {
        let mut config = EngineConfig::default();
        config.adopt_untracked_positions = true;
        let mut rules = HashMap::new();

        let mut naked = position(41, config.magic);
        naked.sl = None;
        let outcome = reconcile_exit_rules(&mut rules, &[naked], &config);
        assert!(outcome.adopted.is_empty());
        assert!(rules.is_empty());
    }
}
