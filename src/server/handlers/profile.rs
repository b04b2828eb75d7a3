use crate::device::capability::Capabilities;
use crate::device::optimizer::StrategyStats;
use crate::device::profile::{DeviceProfileResolver, DeviceSignals, Settings};
use crate::server::AppState;
use axum::{extract::State, response::Json};
use serde::Serialize;

use super::ApiResponse;

/// 本机画像
#[derive(Debug, Serialize)]
pub struct LocalProfile {
    pub capabilities: Capabilities,
    pub signals: DeviceSignals,
    pub settings: Settings,
    pub optimizer: Vec<StrategyStats>,
}

/// GET /api/v1/profile
pub async fn get_profile(State(state): State<AppState>) -> Json<ApiResponse<LocalProfile>> {
    Json(ApiResponse::success(LocalProfile {
        capabilities: state.capabilities.as_ref().clone(),
        signals: state.signals.clone(),
        settings: state.settings.clone(),
        optimizer: state.optimizer.stats(),
    }))
}

/// POST /api/v1/profile/resolve
/// 按给定设备信号计算运行参数（不影响本机配置）
pub async fn resolve_profile(Json(signals): Json<DeviceSignals>) -> Json<ApiResponse<Settings>> {
    Json(ApiResponse::success(DeviceProfileResolver::resolve(&signals)))
}
