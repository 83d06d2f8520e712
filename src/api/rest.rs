// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. This layer is deliberately thin: it
// parses query/body parameters, calls into the query views / simulation
// engine, and serialises their return values as JSON. No business logic.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::insights::{self, InsightsMode, InsightsRule};
use crate::queries::{self, FeedSource, HeatmapQuery, LeverageBand};
use crate::sim::{self, engine, portfolio};
use crate::types::{now_ms, CloseReason, SegmentFilter, Side, SimSource, TimeRange};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/scheduler/status", get(scheduler_status))
        .route("/api/v1/heatmap", get(heatmap))
        .route("/api/v1/symbol/:symbol", get(symbol_detail))
        .route("/api/v1/feed", get(feed))
        .route("/api/v1/insights", get(insights_endpoint))
        .route("/api/v1/insights/rule", get(get_insights_rule))
        .route("/api/v1/insights/rule", post(update_insights_rule))
        .route("/api/v1/simulation/open", post(simulation_open))
        .route("/api/v1/simulation/close", post(simulation_close))
        .route("/api/v1/simulation/list", get(simulation_list))
        .route("/api/v1/simulation/report", get(simulation_report))
        .route("/api/v1/simulation/reconcile", post(simulation_reconcile))
        .route("/api/v1/auto-rule", get(get_auto_rule))
        .route("/api/v1/auto-rule", post(update_auto_rule))
        .route("/api/v1/auto-rule/run", post(run_auto_rule))
        .route("/api/v1/backtest-lite", post(backtest_lite))
        .layer(cors)
        .with_state(state)
}

/// Map an internal error onto a 500 with a JSON body.
fn internal(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{e:#}") })),
    )
}

fn bad_request(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

type ApiResult<T> = Result<T, (StatusCode, Json<serde_json::Value>)>;

// =============================================================================
// Health & status
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": now_ms(),
    }))
}

async fn scheduler_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.scheduler_status.read().clone();
    let errors = state.recent_errors.read().clone();
    Json(json!({ "scheduler": status, "recent_errors": errors }))
}

// =============================================================================
// Read views
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct HeatmapParams {
    time_range: Option<String>,
    side: Option<String>,
    min_traders: Option<usize>,
    leverage_band: Option<String>,
    segment: Option<String>,
}

fn parse_time_range(s: &Option<String>) -> ApiResult<TimeRange> {
    match s {
        None => Ok(TimeRange::default()),
        Some(s) => TimeRange::parse(s).ok_or_else(|| bad_request("unrecognised time_range")),
    }
}

fn parse_segment(s: &Option<String>) -> ApiResult<SegmentFilter> {
    match s {
        None => Ok(SegmentFilter::Both),
        Some(s) => SegmentFilter::parse(s).ok_or_else(|| bad_request("unrecognised segment")),
    }
}

async fn heatmap(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HeatmapParams>,
) -> ApiResult<impl IntoResponse> {
    let query = HeatmapQuery {
        time_range: parse_time_range(&params.time_range)?,
        side: match &params.side {
            None => None,
            Some(s) => Some(Side::parse(s).ok_or_else(|| bad_request("unrecognised side"))?),
        },
        min_traders: params.min_traders.unwrap_or(0),
        leverage_band: match &params.leverage_band {
            None => None,
            Some(s) => {
                Some(LeverageBand::parse(s).ok_or_else(|| bad_request("unrecognised leverage_band"))?)
            }
        },
        segment: parse_segment(&params.segment)?,
    };

    let conn = state.store.conn();
    let items = queries::heatmap(&conn, &state.platform(), &query, now_ms()).map_err(internal)?;
    Ok(Json(items))
}

#[derive(Debug, Default, Deserialize)]
struct SymbolParams {
    time_range: Option<String>,
    segment: Option<String>,
}

async fn symbol_detail(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<SymbolParams>,
) -> ApiResult<impl IntoResponse> {
    let time_range = parse_time_range(&params.time_range)?;
    let segment = parse_segment(&params.segment)?;
    let use_estimated = state.config.read().positioning.use_estimated_open_time;

    let conn = state.store.conn();
    let detail = queries::symbol_detail(
        &conn,
        &state.platform(),
        &symbol,
        time_range,
        segment,
        use_estimated,
        now_ms(),
    )
    .map_err(internal)?;
    Ok(Json(detail))
}

#[derive(Debug, Default, Deserialize)]
struct FeedParams {
    source: Option<String>,
    limit: Option<usize>,
    symbol: Option<String>,
    time_range: Option<String>,
    segment: Option<String>,
}

async fn feed(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedParams>,
) -> ApiResult<impl IntoResponse> {
    let source = match params.source.as_deref() {
        None | Some("events") => FeedSource::Events,
        Some("lifecycle") => FeedSource::Lifecycle,
        Some(_) => return Err(bad_request("unrecognised source")),
    };
    let time_range = parse_time_range(&params.time_range)?;
    let segment = parse_segment(&params.segment)?;
    let use_estimated = state.config.read().positioning.use_estimated_open_time;

    let conn = state.store.conn();
    let items = queries::feed(
        &conn,
        &state.platform(),
        source,
        params.limit.unwrap_or(50).min(500),
        params.symbol.as_deref(),
        time_range,
        segment,
        use_estimated,
        now_ms(),
    )
    .map_err(internal)?;
    Ok(Json(items))
}

// =============================================================================
// Insights
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct InsightsParams {
    time_range: Option<String>,
    segment: Option<String>,
    top: Option<usize>,
    mode: Option<String>,
}

async fn insights_endpoint(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InsightsParams>,
) -> ApiResult<impl IntoResponse> {
    let platform = state.platform();
    let conn = state.store.conn();
    let rule = insights::get_rule(&conn, &platform).map_err(internal)?;

    let time_range = match &params.time_range {
        None => rule.time_range,
        Some(s) => TimeRange::parse(s).ok_or_else(|| bad_request("unrecognised time_range"))?,
    };
    let mode = match &params.mode {
        None => rule.mode,
        Some(s) => InsightsMode::parse(s).ok_or_else(|| bad_request("unrecognised mode"))?,
    };
    let segment = parse_segment(&params.segment)?;
    let top = params.top.unwrap_or(rule.top as usize).min(100);

    let response = insights::compute(&conn, &platform, time_range, segment, top, mode, now_ms())
        .map_err(internal)?;
    Ok(Json(response))
}

async fn get_insights_rule(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let rule = insights::get_rule(&conn, &state.platform()).map_err(internal)?;
    Ok(Json(rule))
}

async fn update_insights_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<InsightsRule>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    insights::save_rule(&conn, &state.platform(), &rule, now_ms()).map_err(internal)?;
    state.increment_version();
    Ok(Json(rule))
}

// =============================================================================
// Simulation
// =============================================================================

async fn simulation_open(
    State(state): State<Arc<AppState>>,
    Json(request): Json<engine::OpenRequest>,
) -> ApiResult<impl IntoResponse> {
    let cfg = state.config.read().simulation.clone();
    let conn = state.store.conn();
    let position = engine::open_position(
        &conn,
        &state.platform(),
        &request,
        &cfg,
        SimSource::Manual,
        now_ms(),
    )
    .map_err(internal)?;
    state.increment_version();
    Ok(Json(position))
}

#[derive(Debug, Deserialize)]
struct CloseParams {
    id: String,
    #[serde(default)]
    price: Option<f64>,
}

async fn simulation_close(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CloseParams>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let position = engine::close_position(
        &conn,
        &state.platform(),
        &params.id,
        CloseReason::Manual,
        params.price,
        None,
        now_ms(),
    )
    .map_err(internal)?;
    state.increment_version();
    Ok(Json(position))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn simulation_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let positions = sim::list_positions(
        &conn,
        &state.platform(),
        params.limit.unwrap_or(100).min(1_000),
    )
    .map_err(internal)?;
    Ok(Json(positions))
}

async fn simulation_report(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let platform = state.platform();
    let conn = state.store.conn();

    let metrics = portfolio::metrics(&conn, &platform).map_err(internal)?;
    let account = portfolio::get(&conn, sim::DEFAULT_PORTFOLIO_ID).map_err(internal)?;
    let analysis = portfolio::analysis(&conn, &platform).map_err(internal)?;

    Ok(Json(json!({
        "portfolio": account,
        "metrics": metrics,
        "analysis": analysis,
    })))
}

async fn simulation_reconcile(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let updated = engine::reconcile(&conn, &state.platform()).map_err(internal)?;
    state.increment_version();
    Ok(Json(json!({ "reconciled": updated })))
}

// =============================================================================
// Auto-trigger rule
// =============================================================================

async fn get_auto_rule(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let rule = engine::get_auto_rule(&conn, &state.platform()).map_err(internal)?;
    Ok(Json(rule))
}

async fn update_auto_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<engine::AutoTriggerRule>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    engine::save_auto_rule(&conn, &state.platform(), &rule, now_ms()).map_err(internal)?;
    state.increment_version();
    let stored = engine::get_auto_rule(&conn, &state.platform()).map_err(internal)?;
    Ok(Json(stored))
}

#[derive(Debug, Default, Deserialize)]
struct RunParams {
    #[serde(default)]
    dry_run: bool,
}

async fn run_auto_rule(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RunParams>,
) -> ApiResult<impl IntoResponse> {
    let cfg = state.config.read().simulation.clone();
    let conn = state.store.conn();
    let outcome = engine::auto_run(&conn, &state.platform(), params.dry_run, &cfg, now_ms())
        .map_err(internal)?;
    if !params.dry_run {
        state.increment_version();
    }
    Ok(Json(outcome))
}

// =============================================================================
// Backtest
// =============================================================================

async fn backtest_lite(
    State(state): State<Arc<AppState>>,
    Json(params): Json<engine::BacktestParams>,
) -> ApiResult<impl IntoResponse> {
    let conn = state.store.conn();
    let response = engine::backtest_lite(&conn, &state.platform(), &params, now_ms())
        .map_err(internal)?;
    Ok(Json(response))
}
