use crate::server::AppState;
use crate::uploader::health::NodeRecord;
use axum::{extract::State, response::Json};
use tracing::info;

use super::ApiResponse;

/// GET /api/v1/nodes
/// 按配置顺序返回节点健康记录
pub async fn get_nodes(State(state): State<AppState>) -> Json<ApiResponse<Vec<NodeRecord>>> {
    Json(ApiResponse::success(state.registry.records()))
}

/// POST /api/v1/nodes/check
/// 立即探测所有节点
pub async fn check_nodes(State(state): State<AppState>) -> Json<ApiResponse<Vec<NodeRecord>>> {
    info!("API: 手动触发节点探测");
    let records = state
        .registry
        .check_all(state.client.as_ref(), &state.limiter)
        .await;
    Json(ApiResponse::success(records))
}
