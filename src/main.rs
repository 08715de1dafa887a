// =============================================================================
// Meridian Trade Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Operators must
// explicitly switch to Live through the control API.
//
// Market data always flows from the terminal bridge; order execution goes to
// the paper broker in Demo mode (paper fills track the live tape) and to the
// bridge in Live mode.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod decision;
mod events;
mod exit;
mod indicators;
mod latency;
mod market_data;
mod oco;
mod persist;
mod planner;
mod protector;
mod regime;
mod runtime_config;
mod session;
mod strategy;
mod templates;
mod types;
mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::app_state::AppState;
use crate::broker::bridge::BridgeBroker;
use crate::broker::gateway::{run_order_queue, OrderGateway};
use crate::broker::paper::PaperBroker;
use crate::broker::BrokerGateway;
use crate::exit::ExitManager;
use crate::latency::LatencyTracker;
use crate::market_data::order_flow::OrderFlowTracker;
use crate::market_data::streamer::run_symbol_pipeline;
use crate::market_data::{CandleKey, MarketRings, SnapshotHub, Timeframe};
use crate::oco::OcoManager;
use crate::persist::{EventLog, JsonStore};
use crate::planner::PlanEngine;
use crate::protector::Protector;
use crate::runtime_config::{watch_config, EngineConfig};
use crate::session::NewsCalendar;
use crate::types::{normalize_symbol, AccountMode, TradingMode};

const CONFIG_PATH: &str = "engine_config.json";

/// Complete candles fetched per (symbol, timeframe) at warm-up.
const WARMUP_CANDLES: usize = 400;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trade Nexus — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // SAFETY: force Demo + Paused on startup.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Symbol list override from the environment.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    let suffix = config.symbol_suffix.clone();
    config.symbols = config
        .symbols
        .iter()
        .map(|s| normalize_symbol(s, &suffix))
        .collect();

    info!(symbols = ?config.symbols, "configured trading symbols");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    let data_dir = std::path::PathBuf::from(&config.data_dir);
    let symbols = config.symbols.clone();
    let is_demo = config.account_mode == AccountMode::Demo;
    let api_bind = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| config.api_bind.clone());
    let shared_config = Arc::new(RwLock::new(config));

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let rings = Arc::new(MarketRings::new(10_000, 1_000));
    let hub = Arc::new(SnapshotHub::new());
    let flow = Arc::new(OrderFlowTracker::new());
    let news = Arc::new(NewsCalendar::new());
    let latency = Arc::new(LatencyTracker::new());
    let vix = Arc::new(RwLock::new(None));
    let positions_mirror = Arc::new(RwLock::new(Vec::new()));
    let (event_bus, event_receivers) = events::channel(1024);

    // ── 3. Brokers ───────────────────────────────────────────────────────
    let bridge_url = shared_config.read().bridge_url.clone();
    let api_key = std::env::var("BRIDGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BRIDGE_API_SECRET").unwrap_or_default();
    let bridge = Arc::new(BridgeBroker::new(bridge_url, api_key, api_secret));
    let paper = Arc::new(PaperBroker::new());

    // Market data always streams from the bridge; execution goes to paper in
    // demo mode so fills track the live tape without touching real funds.
    let exec_broker: Arc<dyn BrokerGateway> = if is_demo {
        paper.clone()
    } else {
        bridge.clone()
    };

    let gateway = Arc::new(OrderGateway::new(
        exec_broker.clone(),
        shared_config.clone(),
        event_bus.clone(),
    ));

    // ── 4. Order queue ───────────────────────────────────────────────────
    let (order_tx, order_rx) = mpsc::channel(256);
    tokio::spawn(run_order_queue(order_rx, gateway.clone()));

    // ── 5. Application state ─────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        shared_config.clone(),
        rings.clone(),
        hub.clone(),
        flow.clone(),
        news.clone(),
        vix.clone(),
        positions_mirror.clone(),
        event_bus.clone(),
        latency.clone(),
        order_tx,
    ));

    // ── 6. Candle warm-up ────────────────────────────────────────────────
    for symbol in &symbols {
        for tf in Timeframe::ALL {
            match bridge.fetch_candles(symbol, tf, WARMUP_CANDLES).await {
                Ok(candles) => {
                    let key = CandleKey::new(symbol.clone(), tf);
                    let count = candles.len();
                    for candle in candles {
                        rings.push_candle(key.clone(), candle);
                    }
                    info!(symbol = %symbol, timeframe = %tf, count, "warm-up candles loaded");
                }
                Err(e) => {
                    warn!(symbol = %symbol, timeframe = %tf, error = %e, "warm-up fetch failed");
                }
            }
        }
    }

    // ── 7. Tick fan-out & per-symbol pipelines ───────────────────────────
    let mut pipeline_txs: HashMap<String, mpsc::Sender<market_data::Tick>> = HashMap::new();
    for symbol in &symbols {
        let (tx, rx) = mpsc::channel(4096);
        pipeline_txs.insert(symbol.clone(), tx);

        let decision_state = state.clone();
        let on_snapshot: Arc<dyn Fn(Arc<market_data::Snapshot>) + Send + Sync> =
            Arc::new(move |snapshot| {
                strategy::evaluate_snapshot(&decision_state, &snapshot);
            });

        tokio::spawn(run_symbol_pipeline(
            symbol.clone(),
            rx,
            rings.clone(),
            flow.clone(),
            hub.clone(),
            latency.clone(),
            on_snapshot,
        ));
    }

    {
        let symbols = symbols.clone();
        let bridge = bridge.clone();
        let paper = paper.clone();
        let state = state.clone();
        let suffix = suffix.clone();
        tokio::spawn(async move {
            loop {
                match bridge.subscribe_ticks(&symbols).await {
                    Ok(mut rx) => {
                        info!("tick subscription established");
                        while let Some(mut tick) = rx.recv().await {
                            tick.symbol = normalize_symbol(&tick.symbol, &suffix);
                            if is_demo {
                                paper.push_quote(tick.clone());
                            }
                            if let Some(tx) = pipeline_txs.get(&tick.symbol) {
                                if tx.try_send(tick).is_err() {
                                    // Pipeline saturated; the ring's gap
                                    // tolerance covers the loss.
                                    state.push_error("tick fan-out backlog", None);
                                }
                            }
                        }
                        warn!("tick subscription ended — resubscribing in 5s");
                    }
                    Err(e) => {
                        error!(error = %e, "tick subscription failed — retrying in 5s");
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── 8. Exit manager, protector, OCO, planner ─────────────────────────
    let exit_manager = Arc::new(ExitManager::new(
        exec_broker.clone(),
        gateway.clone(),
        hub.clone(),
        shared_config.clone(),
        event_bus.clone(),
        JsonStore::new(data_dir.join("exit_rules.json")),
        positions_mirror.clone(),
        vix.clone(),
    ));
    exit_manager.reconcile_startup().await;
    tokio::spawn(exit_manager.clone().run());

    let protector = Arc::new(Protector::new(
        gateway.clone(),
        hub.clone(),
        flow.clone(),
        shared_config.clone(),
        event_bus.clone(),
        positions_mirror.clone(),
    ));
    tokio::spawn(protector.run());

    let oco_manager = Arc::new(OcoManager::new(
        exec_broker.clone(),
        gateway.clone(),
        event_bus.clone(),
        JsonStore::new(data_dir.join("oco_pairs.json")),
    ));
    tokio::spawn(oco_manager.clone().run());

    let plan_engine = Arc::new(PlanEngine::new(
        gateway.clone(),
        hub.clone(),
        news.clone(),
        event_bus.clone(),
        JsonStore::new(data_dir.join("plans.json")),
    ));
    tokio::spawn(plan_engine.clone().run());

    // ── 9. Persistence writer & config watcher ───────────────────────────
    tokio::spawn(persist::run_event_writer(
        event_receivers,
        EventLog::new(data_dir.join("events.log")),
        shared_config.clone(),
    ));
    tokio::spawn(watch_config(CONFIG_PATH.into(), shared_config.clone()));

    // ── 10. API server ───────────────────────────────────────────────────
    let api_context = ApiContext {
        state: state.clone(),
        exits: exit_manager.clone(),
        oco: oco_manager.clone(),
        plans: plan_engine.clone(),
    };
    tokio::spawn(async move {
        let app = api::router(api_context);
        let listener = tokio::net::TcpListener::bind(&api_bind)
            .await
            .expect("failed to bind API server");
        info!(addr = %api_bind, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running — Ctrl+C to stop");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Stop accepting new entries, then give in-flight exit/OCO work and the
    // event writer a bounded window to drain before the process leaves.
    shared_config.write().trading_mode = TradingMode::Killed;
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    if let Err(e) = shared_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("Meridian Trade Nexus shut down complete.");
    Ok(())
}
