use crate::common::telemetry::TelemetrySnapshot;
use crate::server::AppState;
use axum::{extract::State, response::Json};

use super::ApiResponse;

/// GET /api/v1/metrics
/// 采样当前指标（写入历史）
pub async fn get_metrics(
    State(state): State<AppState>,
) -> Json<ApiResponse<TelemetrySnapshot>> {
    state.telemetry.record_memory_usage(state.cache.memory_usage());
    Json(ApiResponse::success(state.telemetry.snapshot()))
}

/// GET /api/v1/metrics/history
pub async fn get_metrics_history(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<TelemetrySnapshot>>> {
    Json(ApiResponse::success(state.telemetry.history()))
}

/// GET /api/v1/metrics/export
/// 当前指标、历史与最近错误
pub async fn export_metrics(State(state): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::success(state.telemetry.export_metrics()))
}

/// DELETE /api/v1/metrics
pub async fn reset_metrics(State(state): State<AppState>) -> Json<ApiResponse<()>> {
    state.telemetry.reset();
    Json(ApiResponse::success(()))
}
