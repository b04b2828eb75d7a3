// 测试用节点客户端
//
// 每个节点可以编排探测结果和上传结果序列，并统计调用次数

use crate::storage::client::NodeClient;
use crate::storage::types::{NodeError, NodeErrorKind, NodeUploadRequest, NodeUploadResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 单次上传的编排结果
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// 延迟后成功
    Success(Duration),
    /// 延迟后失败
    Fail(NodeErrorKind, Duration),
    /// 一直挂起，直到超时或取消
    Hang,
}

#[derive(Debug, Default)]
pub struct MockNodeClient {
    probes: Mutex<HashMap<String, Result<Duration, NodeErrorKind>>>,
    uploads: Mutex<HashMap<String, Vec<MockOutcome>>>,
    failing_files: Mutex<HashSet<String>>,
    upload_calls: Mutex<HashMap<String, usize>>,
    probe_calls: AtomicUsize,
    cancelled_calls: AtomicUsize,
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_probe(&self, endpoint: &str, result: Result<Duration, NodeErrorKind>) {
        self.probes.lock().insert(endpoint.to_string(), result);
    }

    /// 第 n 次上传使用 script[n]，超出后重复最后一个
    pub fn script(&self, endpoint: &str, script: Vec<MockOutcome>) {
        self.uploads.lock().insert(endpoint.to_string(), script);
    }

    /// 指定文件名在所有节点上都返回 5xx
    pub fn fail_file(&self, file_name: &str) {
        self.failing_files.lock().insert(file_name.to_string());
    }

    pub fn recover_file(&self, file_name: &str) {
        self.failing_files.lock().remove(file_name);
    }

    pub fn upload_calls(&self, endpoint: &str) -> usize {
        self.upload_calls.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_upload_calls(&self) -> usize {
        self.upload_calls.lock().values().sum()
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn cancelled_calls(&self) -> usize {
        self.cancelled_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, endpoint: &str, file_name: &str) -> MockOutcome {
        let call = {
            let mut calls = self.upload_calls.lock();
            let counter = calls.entry(endpoint.to_string()).or_insert(0);
            *counter += 1;
            *counter - 1
        };

        if self.failing_files.lock().contains(file_name) {
            return MockOutcome::Fail(NodeErrorKind::ServerError, Duration::from_millis(5));
        }

        self.uploads
            .lock()
            .get(endpoint)
            .and_then(|script| script.get(call).or_else(|| script.last()).cloned())
            .unwrap_or(MockOutcome::Success(Duration::from_millis(10)))
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, NodeError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .probes
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or(Ok(Duration::from_millis(50)));

        match result {
            Ok(latency) if latency <= timeout => {
                tokio::time::sleep(latency).await;
                Ok(latency)
            }
            Ok(_) => {
                tokio::time::sleep(timeout).await;
                Err(NodeError::timeout(timeout))
            }
            Err(kind) => Err(NodeError::new(kind, "scripted probe failure")),
        }
    }

    async fn upload(
        &self,
        endpoint: &str,
        request: &NodeUploadRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<NodeUploadResponse, NodeError> {
        let outcome = self.next_outcome(endpoint, &request.file_name);

        let work = async {
            match outcome {
                MockOutcome::Success(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(NodeUploadResponse {
                        cid: format!("cid-{}", request.file_name),
                        size: Some(serde_json::json!(request.body.len())),
                    })
                }
                MockOutcome::Fail(kind, delay) => {
                    tokio::time::sleep(delay).await;
                    Err(NodeError::new(kind, format!("scripted {:?}", kind)))
                }
                MockOutcome::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(NodeError::new(NodeErrorKind::Network, "hang finished"))
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled_calls.fetch_add(1, Ordering::SeqCst);
                Err(NodeError::cancelled())
            }
            result = tokio::time::timeout(timeout, work) => {
                result.map_err(|_| NodeError::timeout(timeout))?
            }
        }
    }

    fn public_url(&self, endpoint: &str, cid: &str) -> String {
        format!("{}/ipfs/{}", endpoint.trim_end_matches('/'), cid)
    }
}
