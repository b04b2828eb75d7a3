// 上传任务定义
//
// 每个资产对应一个任务，状态单调推进：
// pending → in_flight → {succeeded, failed}
// 失败的任务交还给调用方显式重试，不会被自动复活

use crate::storage::types::AssetMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// 资产来源
#[derive(Debug, Clone)]
pub enum AssetSource {
    /// 已在内存中的负载
    Bytes(Arc<Vec<u8>>),
    /// 本地文件，大文件按块流式读取
    File(PathBuf),
}

/// 待发布的资产
#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub source: AssetSource,
    pub metadata: AssetMetadata,
}

impl Asset {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, metadata: AssetMetadata) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::Bytes(Arc::new(bytes)),
            metadata,
        }
    }

    /// 以文件名作为资产名称
    pub fn from_file(path: PathBuf, metadata: AssetMetadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            name,
            source: AssetSource::File(path),
            metadata,
        }
    }

    /// 资产大小（文件需要读取元数据）
    pub async fn size(&self) -> std::io::Result<u64> {
        match &self.source {
            AssetSource::Bytes(bytes) => Ok(bytes.len() as u64),
            AssetSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }
}

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 上传中
    InFlight,
    /// 已成功
    Succeeded,
    /// 失败
    Failed,
}

impl UploadTaskStatus {
    fn rank(&self) -> u8 {
        match self {
            UploadTaskStatus::Pending => 0,
            UploadTaskStatus::InFlight => 1,
            UploadTaskStatus::Succeeded | UploadTaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 资产名称
    pub name: String,
    /// 负载大小
    pub size: u64,
    /// 内容哈希
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub metadata: AssetMetadata,
    /// 候选节点
    #[serde(default)]
    pub candidate_nodes: Vec<String>,
    /// 已尝试的节点请求次数
    #[serde(default)]
    pub attempts: u32,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 胜出的节点
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 是否命中缓存
    #[serde(default)]
    pub from_cache: bool,
    /// 优化策略（未优化为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_by: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(name: String, size: u64, metadata: AssetMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            size,
            content_hash: None,
            metadata,
            candidate_nodes: Vec::new(),
            attempts: 0,
            status: UploadTaskStatus::Pending,
            node: None,
            cid: None,
            url: None,
            from_cache: false,
            optimized_by: None,
            error: None,
            error_kind: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 状态只能前进
    fn advance(&mut self, to: UploadTaskStatus) -> bool {
        if self.status.is_terminal() || to.rank() <= self.status.rank() {
            return false;
        }
        self.status = to;
        true
    }

    /// 标记为上传中
    pub fn mark_in_flight(&mut self) -> bool {
        let moved = self.advance(UploadTaskStatus::InFlight);
        if moved && self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        moved
    }

    /// 标记为成功
    pub fn mark_succeeded(
        &mut self,
        node: Option<String>,
        cid: String,
        url: String,
        from_cache: bool,
    ) -> bool {
        if !self.advance(UploadTaskStatus::Succeeded) {
            return false;
        }
        self.node = node;
        self.cid = Some(cid);
        self.url = Some(url);
        self.from_cache = from_cache;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, kind: &str, error: String) -> bool {
        if !self.advance(UploadTaskStatus::Failed) {
            return false;
        }
        self.error_kind = Some(kind.to_string());
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> UploadTask {
        UploadTask::new("cat.png".to_string(), 1000, AssetMetadata::named("cat"))
    }

    #[test]
    fn test_task_creation() {
        let task = task();
        assert_eq!(task.status, UploadTaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.started_at.is_none());
        assert!(!task.from_cache);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = task();
        assert!(task.mark_in_flight());
        assert_eq!(task.status, UploadTaskStatus::InFlight);
        assert!(task.started_at.is_some());

        assert!(task.mark_succeeded(
            Some("http://node1".to_string()),
            "bafy".to_string(),
            "http://node1/ipfs/bafy".to_string(),
            false
        ));
        assert_eq!(task.status, UploadTaskStatus::Succeeded);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = task();
        task.mark_in_flight();
        assert!(task.mark_failed("all_nodes_failed", "boom".to_string()));

        // 失败的任务不会被复活
        assert!(!task.mark_in_flight());
        assert!(!task.mark_succeeded(None, "x".to_string(), "y".to_string(), true));
        assert_eq!(task.status, UploadTaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.cid.is_none());
    }

    #[test]
    fn test_pending_can_go_straight_to_terminal() {
        let mut task = task();
        assert!(task.mark_succeeded(None, "c".to_string(), "u".to_string(), true));
        assert!(task.from_cache);
        assert!(!task.mark_in_flight());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&UploadTaskStatus::InFlight).unwrap(),
            "\"in_flight\""
        );
    }

    #[tokio::test]
    async fn test_asset_size() {
        let asset = Asset::from_bytes("a", vec![0u8; 42], AssetMetadata::default());
        assert_eq!(asset.size().await.unwrap(), 42);

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello").unwrap();
        let asset = Asset::from_file(file.path().to_path_buf(), AssetMetadata::default());
        assert_eq!(asset.size().await.unwrap(), 5);
        assert!(!asset.name.is_empty());
    }
}
