// 诊断服务模块

pub mod handlers;
pub mod state;

pub use handlers::ApiResponse;
pub use state::AppState;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "content-publish-rust".to_string(),
    })
}

/// 构建完整路由
pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        // 遥测
        .route("/metrics", get(handlers::get_metrics))
        .route("/metrics", delete(handlers::reset_metrics))
        .route("/metrics/history", get(handlers::get_metrics_history))
        .route("/metrics/export", get(handlers::export_metrics))
        // 缓存
        .route("/cache/stats", get(handlers::get_cache_stats))
        .route("/cache/search", get(handlers::search_cache))
        .route("/cache/:key", delete(handlers::delete_cache_entry))
        .route("/cache", delete(handlers::clear_cache))
        // 节点
        .route("/nodes", get(handlers::get_nodes))
        .route("/nodes/check", post(handlers::check_nodes))
        // 设备画像
        .route("/profile", get(handlers::get_profile))
        .route("/profile/resolve", post(handlers::resolve_profile))
        // 上传
        .route("/uploads", post(handlers::create_upload))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
