// 存储节点相关类型定义

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 节点错误类型（用于重试判断与健康度更新）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// 网络错误：连接重置、DNS 等（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流 429（可重试，需要更长等待时间）
    RateLimited,
    /// 节点不可达：连接被拒绝（不重试，直接换下一个候选节点）
    Unreachable,
    /// 负载过大 413（不可重试，直接返回调用方）
    PayloadTooLarge,
    /// 不支持的类型 415（不可重试，直接返回调用方）
    UnsupportedMedia,
    /// 参数错误 4xx（不可重试）
    BadRequest,
    /// 响应无法解析（不可重试）
    InvalidResponse,
    /// 已取消
    Cancelled,
}

impl NodeErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NodeErrorKind::Network
                | NodeErrorKind::Timeout
                | NodeErrorKind::ServerError
                | NodeErrorKind::RateLimited
        )
    }

    /// 是否为负载被拒绝（类型错误/体积过大），需要立即失败
    pub fn is_payload_rejection(&self) -> bool {
        matches!(
            self,
            NodeErrorKind::PayloadTooLarge | NodeErrorKind::UnsupportedMedia
        )
    }

    /// 是否说明节点本身不健康（用于健康度降级）
    pub fn indicates_unhealthy(&self) -> bool {
        matches!(
            self,
            NodeErrorKind::Unreachable
                | NodeErrorKind::Network
                | NodeErrorKind::Timeout
                | NodeErrorKind::ServerError
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            408 => NodeErrorKind::Timeout,
            413 => NodeErrorKind::PayloadTooLarge,
            415 => NodeErrorKind::UnsupportedMedia,
            429 => NodeErrorKind::RateLimited,
            400..=499 => NodeErrorKind::BadRequest,
            500..=599 => NodeErrorKind::ServerError,
            _ => NodeErrorKind::InvalidResponse,
        }
    }

    /// 从 reqwest 错误分类
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            NodeErrorKind::Timeout
        } else if let Some(status) = error.status() {
            Self::from_status(status)
        } else if error.is_connect() {
            NodeErrorKind::Unreachable
        } else if error.is_decode() {
            NodeErrorKind::InvalidResponse
        } else {
            NodeErrorKind::Network
        }
    }
}

/// 单个节点的调用错误
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            NodeErrorKind::Timeout,
            format!("请求超时 ({}ms)", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(NodeErrorKind::Cancelled, "请求已取消")
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(NodeErrorKind::from_reqwest(&error), error.to_string())
    }
}

/// 资产属性（名称/值对）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAttribute {
    pub trait_type: String,
    pub value: serde_json::Value,
}

/// 资产元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AssetAttribute>,
}

impl AssetMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 用于缓存检索的关键词（名称按非字母数字切分 + 属性值）
    pub fn search_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for attribute in &self.attributes {
            if let Some(value) = attribute.value.as_str() {
                tokens.push(value.to_lowercase());
            }
        }

        tokens.sort();
        tokens.dedup();
        tokens
    }
}

/// 上传请求体
#[derive(Debug, Clone)]
pub enum UploadBody {
    /// 已在内存中的负载
    Bytes(std::sync::Arc<Vec<u8>>),
    /// 大文件：按块流式读取
    File {
        path: std::path::PathBuf,
        size: u64,
        chunk_size: usize,
    },
}

impl UploadBody {
    pub fn len(&self) -> u64 {
        match self {
            UploadBody::Bytes(bytes) => bytes.len() as u64,
            UploadBody::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 发往单个节点的上传请求
#[derive(Debug, Clone)]
pub struct NodeUploadRequest {
    pub file_name: String,
    pub body: UploadBody,
    pub metadata: AssetMetadata,
}

/// 节点上传响应
///
/// 兼容 `{"Hash": ...}` 与 `{"cid": ...}` 两种返回格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUploadResponse {
    #[serde(alias = "Hash", alias = "hash", alias = "IpfsHash")]
    pub cid: String,
    #[serde(default, alias = "Size", skip_serializing_if = "Option::is_none")]
    pub size: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retriable() {
        assert!(NodeErrorKind::Network.is_retriable());
        assert!(NodeErrorKind::Timeout.is_retriable());
        assert!(NodeErrorKind::ServerError.is_retriable());
        assert!(NodeErrorKind::RateLimited.is_retriable());

        assert!(!NodeErrorKind::Unreachable.is_retriable());
        assert!(!NodeErrorKind::PayloadTooLarge.is_retriable());
        assert!(!NodeErrorKind::BadRequest.is_retriable());
        assert!(!NodeErrorKind::Cancelled.is_retriable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(
            NodeErrorKind::from_status(StatusCode::PAYLOAD_TOO_LARGE),
            NodeErrorKind::PayloadTooLarge
        );
        assert_eq!(
            NodeErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            NodeErrorKind::RateLimited
        );
        assert_eq!(
            NodeErrorKind::from_status(StatusCode::BAD_GATEWAY),
            NodeErrorKind::ServerError
        );
        assert_eq!(
            NodeErrorKind::from_status(StatusCode::NOT_FOUND),
            NodeErrorKind::BadRequest
        );
        assert!(NodeErrorKind::from_status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .is_payload_rejection());
    }

    #[test]
    fn test_response_aliases() {
        let a: NodeUploadResponse =
            serde_json::from_str(r#"{"Name":"a.png","Hash":"bafy123","Size":"42"}"#).unwrap();
        assert_eq!(a.cid, "bafy123");

        let b: NodeUploadResponse = serde_json::from_str(r#"{"cid":"bafy456"}"#).unwrap();
        assert_eq!(b.cid, "bafy456");
    }

    #[test]
    fn test_search_tokens() {
        let metadata = AssetMetadata {
            name: "Cool Cat #12".to_string(),
            description: None,
            attributes: vec![AssetAttribute {
                trait_type: "background".to_string(),
                value: serde_json::json!("Blue"),
            }],
        };
        assert_eq!(metadata.search_tokens(), vec!["12", "blue", "cat", "cool"]);
    }
}
