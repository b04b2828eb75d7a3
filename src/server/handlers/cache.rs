use crate::cache::{CacheEntryInfo, CacheQuery, CacheStats};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::info;

use super::ApiResponse;

/// GET /api/v1/cache/stats
pub async fn get_cache_stats(State(state): State<AppState>) -> Json<ApiResponse<CacheStats>> {
    Json(ApiResponse::success(state.cache.stats()))
}

/// GET /api/v1/cache/search?text=&size_class=&limit=
pub async fn search_cache(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Json<ApiResponse<Vec<CacheEntryInfo>>> {
    Json(ApiResponse::success(state.cache.search(&query)))
}

/// DELETE /api/v1/cache/:key
pub async fn delete_cache_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    if state.cache.delete(&key) {
        info!("删除缓存条目: {}", key);
        Ok(Json(ApiResponse::success(key)))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// DELETE /api/v1/cache
pub async fn clear_cache(State(state): State<AppState>) -> Json<ApiResponse<usize>> {
    let removed = state.cache.len();
    state.cache.clear();
    info!("清空缓存: {} 个条目", removed);
    Json(ApiResponse::success(removed))
}
