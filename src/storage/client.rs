// 存储节点客户端
//
// 节点协议只有两个请求：
// - 健康探测：对约定的对象发 HEAD 请求
// - 上传：multipart 表单（file + name/description/attributes），返回内容标识

use crate::config::NodesConfig;
use crate::storage::types::{
    NodeError, NodeErrorKind, NodeUploadRequest, NodeUploadResponse, UploadBody,
};
use crate::uploader::chunk::StreamChunker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 节点客户端接口
///
/// 发布器与健康注册表只依赖这个接口，测试中以内存实现替换
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// 探测节点，返回往返耗时
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, NodeError>;

    /// 上传负载，返回节点分配的内容标识
    async fn upload(
        &self,
        endpoint: &str,
        request: &NodeUploadRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<NodeUploadResponse, NodeError>;

    /// 根据内容标识拼出可访问的 URL
    fn public_url(&self, endpoint: &str, cid: &str) -> String;
}

/// 基于 reqwest 的节点客户端
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: Client,
    probe_path: String,
    upload_path: String,
    public_url_template: String,
    chunker: StreamChunker,
}

impl HttpNodeClient {
    /// 创建新的节点客户端
    pub fn new(config: &NodesConfig, chunker: StreamChunker) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.probe_timeout_secs.max(1)))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("content-publish-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            probe_path: config.probe_path.clone(),
            upload_path: config.upload_path.clone(),
            public_url_template: config.public_url_template.clone(),
            chunker,
        })
    }

    fn join(endpoint: &str, path: &str) -> String {
        format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn build_form(
        &self,
        request: &NodeUploadRequest,
        cancel: &CancellationToken,
    ) -> Result<multipart::Form, NodeError> {
        let part = match &request.body {
            UploadBody::Bytes(bytes) => multipart::Part::bytes(bytes.as_ref().clone()),
            UploadBody::File {
                path,
                size,
                chunk_size,
            } => {
                let chunker = StreamChunker::new(*chunk_size)
                    .with_flush_threshold(self.chunker.flush_threshold());
                let stream = chunker.file_stream(path.clone(), *size, cancel.child_token());
                multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), *size)
            }
        };

        let part = part
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| NodeError::new(NodeErrorKind::BadRequest, e.to_string()))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("name", request.metadata.name.clone());

        if let Some(description) = &request.metadata.description {
            form = form.text("description", description.clone());
        }
        if !request.metadata.attributes.is_empty() {
            let attributes = serde_json::to_string(&request.metadata.attributes)
                .map_err(|e| NodeError::new(NodeErrorKind::BadRequest, e.to_string()))?;
            form = form.text("attributes", attributes);
        }

        Ok(form)
    }

    async fn send_upload(
        &self,
        url: &str,
        form: multipart::Form,
    ) -> Result<NodeUploadResponse, NodeError> {
        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NodeError::new(
                NodeErrorKind::from_status(status),
                format!("上传返回状态码 {}: {}", status, body),
            ));
        }

        let text = response.text().await?;
        serde_json::from_str::<NodeUploadResponse>(&text).map_err(|e| {
            NodeError::new(
                NodeErrorKind::InvalidResponse,
                format!("解析上传响应失败: {}, body={}", e, text),
            )
        })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, NodeError> {
        let url = Self::join(endpoint, &self.probe_path);
        let start = Instant::now();

        let response = tokio::time::timeout(timeout, self.client.head(&url).send())
            .await
            .map_err(|_| NodeError::timeout(timeout))??;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            let elapsed = start.elapsed();
            debug!("节点探测成功: {}, status={}, 耗时={:?}", url, status, elapsed);
            Ok(elapsed)
        } else {
            Err(NodeError::new(
                NodeErrorKind::from_status(status),
                format!("探测返回状态码 {}", status),
            ))
        }
    }

    async fn upload(
        &self,
        endpoint: &str,
        request: &NodeUploadRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<NodeUploadResponse, NodeError> {
        let url = Self::join(endpoint, &self.upload_path);
        let form = self.build_form(request, cancel)?;

        debug!(
            "上传到节点: url={}, name={}, size={}",
            url,
            request.file_name,
            request.body.len()
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(NodeError::cancelled()),
            result = tokio::time::timeout(timeout, self.send_upload(&url, form)) => {
                result.map_err(|_| NodeError::timeout(timeout))?
            }
        }
    }

    fn public_url(&self, endpoint: &str, cid: &str) -> String {
        self.public_url_template
            .replace("{endpoint}", endpoint.trim_end_matches('/'))
            .replace("{cid}", cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpNodeClient {
        HttpNodeClient::new(&NodesConfig::default(), StreamChunker::default()).unwrap()
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(
            HttpNodeClient::join("https://node.example/", "/api/v0/add"),
            "https://node.example/api/v0/add"
        );
        assert_eq!(
            HttpNodeClient::join("https://node.example", "health"),
            "https://node.example/health"
        );
    }

    #[test]
    fn test_public_url_template() {
        let client = client();
        assert_eq!(
            client.public_url("https://node.example/", "bafy123"),
            "https://node.example/ipfs/bafy123"
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_classified() {
        // 绑定临时端口后立即关闭，保证无人监听
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        // 不经过环境变量中的代理
        let client = HttpNodeClient {
            client: Client::builder().no_proxy().build().unwrap(),
            ..client()
        };
        let err = client
            .probe(&format!("http://127.0.0.1:{}", port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::Unreachable);
    }
}
