// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// CORS is configured permissively; the service is meant to sit behind an
// operator network.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::protection::plan::validate_decision;
use crate::trade_log::TradeLog;
use crate::types::Decision;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/protection", get(protection))
        .route("/api/v1/workers", get(workers))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/decisions", post(submit_decision))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    account_mode: String,
    uptime_secs: u64,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        account_mode: state.runtime_config.read().account_mode.to_string(),
        uptime_secs: state.uptime_secs(),
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Observability (authenticated)
// =============================================================================

async fn protection(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.book.statuses())
}

async fn workers(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "workers": state.workers(),
        "pending_decisions": state.pending_decisions(),
    }))
}

async fn errors(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors())
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let path = state.runtime_config.read().trade_log_path.clone();
    match TradeLog::new(&path).read_all() {
        Ok(records) => Ok(Json(records)),
        Err(e) => {
            warn!(path = %path, error = %e, "trade log unreadable");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e:#}") })),
            ))
        }
    }
}

// =============================================================================
// Decision intake (authenticated)
// =============================================================================

async fn submit_decision(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(decision): Json<Decision>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if let Err(e) = validate_decision(&decision) {
        warn!(symbol = %decision.symbol, error = %e, "decision rejected at intake");
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        ));
    }
    let known = state.runtime_config.read().symbols.contains(&decision.symbol);
    if !known {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("symbol '{}' is not configured", decision.symbol),
            })),
        ));
    }

    info!(symbol = %decision.symbol, side = %decision.side, "decision queued");
    let pending = state.push_decision(decision);
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "pending": pending }))))
}
