use crate::server::AppState;
use crate::storage::types::{AssetAttribute, AssetMetadata};
use crate::uploader::manager::OrchestrationReport;
use crate::uploader::task::Asset;
use axum::{extract::State, http::StatusCode, response::Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::{info, warn};

use super::ApiResponse;

/// 上传资产（内容为 base64）
#[derive(Debug, Deserialize)]
pub struct UploadAssetItem {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AssetAttribute>,
}

/// 批量上传请求
#[derive(Debug, Deserialize)]
pub struct CreateUploadRequest {
    pub assets: Vec<UploadAssetItem>,
}

/// POST /api/v1/uploads
/// 发布一组资产，返回逐项结果与批次统计
pub async fn create_upload(
    State(state): State<AppState>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<Json<ApiResponse<OrchestrationReport>>, (StatusCode, Json<ApiResponse<()>>)> {
    let mut assets = Vec::with_capacity(req.assets.len());
    for item in req.assets {
        let bytes = STANDARD.decode(item.content.as_bytes()).map_err(|e| {
            warn!("上传请求内容解码失败: name={}, 错误={}", item.name, e);
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(
                    400,
                    format!("{} 的内容不是合法的 base64: {}", item.name, e),
                )),
            )
        })?;
        let metadata = AssetMetadata {
            name: item.name.clone(),
            description: item.description,
            attributes: item.attributes,
        };
        assets.push(Asset::from_bytes(item.name, bytes, metadata));
    }

    info!("API: 发布 {} 个资产", assets.len());
    let report = state
        .orchestrator
        .run(&assets, &state.shutdown.child_token())
        .await;
    Ok(Json(ApiResponse::success(report)))
}
