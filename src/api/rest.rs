// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The API carries three kinds of
// traffic: ops (health, state, control), advisor intake (trade candidates
// and conditional plans — both untrusted until validated), and collaborator
// feeds (news blackouts, volatility index readings).
//
// CORS is configured permissively for development; tighten in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::decision::TradeSpec;
use crate::exit::ExitManager;
use crate::oco::OcoManager;
use crate::planner::{Plan, PlanEngine};
use crate::session::NewsWindow;
use crate::types::TradingMode;

/// Everything the handlers need, bundled as the router state.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub exits: Arc<ExitManager>,
    pub oco: Arc<OcoManager>,
    pub plans: Arc<PlanEngine>,
}

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(context: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Ops ─────────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/regime", get(regime))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        // ── Advisor intake ──────────────────────────────────────────
        .route("/api/v1/advisor", post(advisor_intake))
        .route("/api/v1/plans", get(list_plans))
        .route("/api/v1/plans", post(create_plan))
        .route("/api/v1/plans/:plan_id/cancel", post(cancel_plan))
        .route("/api/v1/oco", post(arm_oco))
        // ── Collaborator feeds ──────────────────────────────────────
        .route("/api/v1/news", post(set_news))
        .route("/api/v1/vix", post(set_vix))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(context)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    state_version: u64,
    trading_mode: String,
    account_mode: String,
    /// Per-(symbol, timeframe) freshness flags.
    freshness: std::collections::HashMap<String, std::collections::HashMap<String, bool>>,
    /// Symbols degraded to exits-only management.
    exits_only: Vec<String>,
    order_queue_depth: usize,
    dropped_context_events: u64,
    quarantined_rules: usize,
    latency: std::collections::HashMap<String, crate::latency::StageLatency>,
    server_time: i64,
}

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let state = &ctx.state;
    let config = state.runtime_config.read();
    let order_queue_depth =
        state.order_tx.max_capacity() - state.order_tx.capacity();
    let quarantined_rules = ctx
        .exits
        .rules_snapshot()
        .iter()
        .filter(|r| r.quarantined)
        .count();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        state_version: state.current_state_version(),
        trading_mode: config.trading_mode.to_string(),
        account_mode: config.account_mode.to_string(),
        freshness: state.freshness(),
        exits_only: state.exits_only_symbols(),
        order_queue_depth,
        dropped_context_events: state.events.dropped_context_events(),
        quarantined_rules,
        latency: state.latency.summaries(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// State & audit
// =============================================================================

async fn full_state(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let state = &ctx.state;
    let config = state.runtime_config.read().clone();

    let regimes: std::collections::HashMap<String, serde_json::Value> = state
        .regimes
        .read()
        .iter()
        .map(|(symbol, tracker)| {
            (
                symbol.clone(),
                serde_json::json!({
                    "regime": tracker.confirmed.to_string(),
                    "confidence": tracker.confidence,
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
        "trading_mode": config.trading_mode.to_string(),
        "account_mode": config.account_mode.to_string(),
        "symbols": config.symbols,
        "positions": state.positions_mirror.read().clone(),
        "exit_rules": ctx.exits.rules_snapshot(),
        "oco_pairs": ctx.oco.pairs_snapshot(),
        "plans": ctx.plans.plans_snapshot(),
        "recent_decisions": state.recent_decisions.read().clone(),
        "recent_errors": state.recent_errors.read().clone(),
        "regimes": regimes,
        "news_windows": state.news.snapshot(),
        "vix": *state.vix.read(),
    }))
}

async fn positions(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.positions_mirror.read().clone())
}

async fn decisions(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.recent_decisions.read().clone())
}

async fn regime(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let regimes: std::collections::HashMap<String, String> = ctx
        .state
        .regimes
        .read()
        .iter()
        .map(|(symbol, tracker)| (symbol.clone(), tracker.confirmed.to_string()))
        .collect();
    Json(regimes)
}

// =============================================================================
// Control
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.runtime_config.write().trading_mode = TradingMode::Paused;
    ctx.state.increment_version();
    info!("trading PAUSED via API");
    Json(ControlResponse {
        trading_mode: "Paused".into(),
        message: "Trading paused — exits still managed".into(),
    })
}

async fn control_resume(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.runtime_config.write().trading_mode = TradingMode::Live;
    ctx.state.increment_version();
    info!("trading RESUMED via API");
    Json(ControlResponse {
        trading_mode: "Live".into(),
        message: "Trading resumed".into(),
    })
}

async fn control_kill(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.runtime_config.write().trading_mode = TradingMode::Killed;
    ctx.state.increment_version();
    warn!("trading KILLED via API");
    Json(ControlResponse {
        trading_mode: "Killed".into(),
        message: "Trading killed — manual restart required".into(),
    })
}

// =============================================================================
// Advisor intake
// =============================================================================

/// One advisor response: a candidate, a plan, or an abstention. Everything
/// here is untrusted; candidates pass the validator before any order.
#[derive(Deserialize)]
struct AdvisorPayload {
    #[serde(default)]
    trade_spec: Option<TradeSpec>,
    #[serde(default)]
    plan: Option<Plan>,
    #[serde(default)]
    abstain: bool,
    #[serde(default)]
    abstain_reason: Option<String>,
}

async fn advisor_intake(
    State(ctx): State<ApiContext>,
    Json(payload): Json<AdvisorPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if payload.abstain {
        info!(reason = ?payload.abstain_reason, "advisor abstained");
        return Ok(Json(serde_json::json!({"accepted": "abstention"})));
    }
    if let Some(spec) = payload.trade_spec {
        let symbol = spec.symbol.clone();
        ctx.state.push_proposal(spec);
        info!(symbol = %symbol, "advisor candidate queued for validation");
        return Ok(Json(serde_json::json!({
            "accepted": "trade_spec",
            "symbol": symbol,
        })));
    }
    if let Some(plan) = payload.plan {
        let registered = ctx.plans.add(plan);
        return Ok(Json(serde_json::json!({
            "accepted": "plan",
            "plan_id": registered.plan_id,
        })));
    }
    Err((
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": "payload must carry trade_spec, plan, or abstain",
        })),
    ))
}

// =============================================================================
// Plans
// =============================================================================

async fn list_plans(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.plans.plans_snapshot())
}

async fn create_plan(
    State(ctx): State<ApiContext>,
    Json(plan): Json<Plan>,
) -> impl IntoResponse {
    let registered = ctx.plans.add(plan);
    Json(registered)
}

async fn cancel_plan(
    State(ctx): State<ApiContext>,
    Path(plan_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if ctx.plans.cancel(&plan_id) {
        Ok(Json(serde_json::json!({"cancelled": plan_id})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no pending plan with that id"})),
        ))
    }
}

// =============================================================================
// OCO
// =============================================================================

#[derive(Deserialize)]
struct OcoRequest {
    leg_a: TradeSpec,
    leg_b: TradeSpec,
}

async fn arm_oco(
    State(ctx): State<ApiContext>,
    Json(request): Json<OcoRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match ctx.oco.arm(&request.leg_a, &request.leg_b).await {
        Ok(pair) => Ok(Json(pair)),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}

// =============================================================================
// Collaborator feeds
// =============================================================================

#[derive(Deserialize)]
struct NewsPayload {
    windows: Vec<NewsWindow>,
}

async fn set_news(
    State(ctx): State<ApiContext>,
    Json(payload): Json<NewsPayload>,
) -> impl IntoResponse {
    let count = payload.windows.len();
    ctx.state.news.replace(payload.windows);
    ctx.state.increment_version();
    Json(serde_json::json!({"windows": count}))
}

#[derive(Deserialize)]
struct VixPayload {
    value: f64,
}

async fn set_vix(
    State(ctx): State<ApiContext>,
    Json(payload): Json<VixPayload>,
) -> impl IntoResponse {
    *ctx.state.vix.write() = Some(payload.value);
    ctx.state.increment_version();
    Json(serde_json::json!({"vix": payload.value}))
}
