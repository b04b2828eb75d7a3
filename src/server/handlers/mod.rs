// API处理器模块

pub mod cache;
pub mod metrics;
pub mod nodes;
pub mod profile;
pub mod uploads;

pub use cache::*;
pub use metrics::*;
pub use nodes::*;
pub use profile::*;
pub use uploads::*;

use serde::Serialize;

/// 统一响应格式
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}
