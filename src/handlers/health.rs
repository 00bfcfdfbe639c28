use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::time::Instant;

use crate::handlers::AppState;
use crate::services::payments::ProviderKind;
use crate::ApiResponse;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub database: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_error: Option<String>,
    pub latency_ms: u64,
    pub uptime_secs: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub environment: String,
    pub providers: Vec<ProviderKind>,
    pub uptime_secs: u64,
    pub timestamp: String,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// Database-backed health check. 503 when the pool cannot be pinged.
async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let start = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let database = if db_result.is_ok() {
        ComponentStatus::Up
    } else {
        ComponentStatus::Down
    };

    let body = HealthResponse {
        status: database,
        database,
        database_error: db_result.err().map(|e| e.to_string()),
        latency_ms: start.elapsed().as_millis() as u64,
        uptime_secs: uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let code = if database == ComponentStatus::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ApiResponse::success(body)))
}

async fn api_status(State(state): State<AppState>) -> Json<ApiResponse<StatusResponse>> {
    Json(ApiResponse::success(StatusResponse {
        service: "marketplace-api",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.environment.clone(),
        providers: state.services.payments.configured(),
        uptime_secs: uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /health` and `GET /status`.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(api_status))
}
