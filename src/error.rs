// 发布流水线错误定义
//
// 错误分类：
// - TransientNetwork: 超时、5xx、连接重置，按重试策略退避重试；
//   只有一个候选节点且重试耗尽时才作为资产的最终错误
// - NodeUnhealthy: 跳过该节点换下一个候选，不消耗重试次数；
//   没有候选可换时作为资产的最终错误
// - PayloadRejected: 类型错误/体积过大，立即失败
// - CacheDecodeFailure: 缓存读取失败，按未命中处理
// - AllNodesFailed: 单个资产的最终失败，附带每个节点的失败原因
// - StreamRead: 读取中断，只影响当前资产

use crate::storage::types::NodeErrorKind;
use crate::uploader::chunk::StreamReadError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单个节点的失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub kind: NodeErrorKind,
    pub reason: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}): {}", self.node, self.kind, self.reason)
    }
}

/// 发布错误
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("节点 {} 网络暂时不可用，重试已耗尽: {}", .0.node, .0.reason)]
    TransientNetwork(NodeFailure),

    #[error("节点 {} 不健康: {}", .0.node, .0.reason)]
    NodeUnhealthy(NodeFailure),

    #[error("负载被拒绝: {reason}")]
    PayloadRejected { node: Option<String>, reason: String },

    #[error("缓存条目 {key} 解码失败: {reason}")]
    CacheDecodeFailure { key: String, reason: String },

    #[error("所有节点上传失败 ({} 个): {}", .failures.len(), format_failures(.failures))]
    AllNodesFailed { failures: Vec<NodeFailure> },

    #[error(transparent)]
    StreamRead(#[from] StreamReadError),

    #[error("没有可用的存储节点")]
    NoAvailableNodes,

    #[error("上传已取消")]
    Cancelled,

    #[error("优化失败: {0}")]
    Optimize(String),

    #[error("读取资产失败: {0}")]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PublishError {
    /// 错误分类名称（用于遥测与 API 返回）
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::TransientNetwork(_) => "transient_network",
            PublishError::NodeUnhealthy(_) => "node_unhealthy",
            PublishError::PayloadRejected { .. } => "payload_rejected",
            PublishError::CacheDecodeFailure { .. } => "cache_decode_failure",
            PublishError::AllNodesFailed { .. } => "all_nodes_failed",
            PublishError::StreamRead(_) => "stream_read",
            PublishError::NoAvailableNodes => "no_available_nodes",
            PublishError::Cancelled => "cancelled",
            PublishError::Optimize(_) => "optimize",
            PublishError::Io(_) => "io",
        }
    }

    /// 每个节点的失败原因
    pub fn failed_nodes(&self) -> &[NodeFailure] {
        match self {
            PublishError::AllNodesFailed { failures } => failures,
            PublishError::TransientNetwork(failure) | PublishError::NodeUnhealthy(failure) => {
                std::slice::from_ref(failure)
            }
            _ => &[],
        }
    }

    /// 所有候选节点都失败后的最终错误
    ///
    /// 只有一个节点参与时保留它的具体分类
    pub fn from_node_failures(mut failures: Vec<NodeFailure>) -> Self {
        if failures.len() == 1 {
            let kind = failures[0].kind;
            if kind == NodeErrorKind::Unreachable {
                return PublishError::NodeUnhealthy(failures.remove(0));
            }
            if kind.is_retriable() {
                return PublishError::TransientNetwork(failures.remove(0));
            }
        }
        PublishError::AllNodesFailed { failures }
    }

    /// 调用方能否重新提交该资产
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PublishError::PayloadRejected { .. })
    }
}

/// 缓存错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("条目过大: {size} 字节，超出内存预算 {budget} 字节")]
    EntryTooLarge { size: u64, budget: u64 },

    #[error("编码失败: {0}")]
    Encode(String),

    #[error("解码失败: {0}")]
    Decode(String),
}
