// 冗余发布引擎
//
// 核心功能：
// 1. 按内容哈希查缓存，命中则零网络请求直接返回；
//    同一内容同时只有一个上传在进行，后到者等它结束后走缓存
// 2. 占用一个并发槽位，向延迟最低的 K 个健康节点同时上传
// 3. 每个节点独立超时、按重试策略退避重试
// 4. 在所有已结束的成功结果中选延迟最低的一个（不是最先返回的）
// 5. 结果写入缓存、遥测与节点健康表
//
// 并发策略：
// - 使用 JoinSet 管理每个节点的上传任务
// - 每个节点持有子取消令牌，输掉的请求被显式取消
// - 任一节点拒绝负载（类型错误/过大）时立即取消其余节点
// - 节点不可达时从候选队列补上下一个节点，不消耗重试次数

use crate::cache::{CacheOptions, ContentCache};
use crate::common::limiter::ConcurrencyLimiter;
use crate::common::retry::RetryPolicy;
use crate::common::telemetry::TelemetryAggregator;
use crate::config::PublishConfig;
use crate::error::{NodeFailure, PublishError};
use crate::storage::client::NodeClient;
use crate::storage::types::{NodeErrorKind, NodeUploadRequest, UploadBody};
use crate::uploader::chunk::StreamChunker;
use crate::uploader::hasher::ContentHasher;
use crate::uploader::health::NodeHealthRegistry;
use crate::uploader::task::{Asset, AssetSource};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 超过此大小的内存负载在阻塞线程池中计算哈希
const OFFLOAD_HASH_THRESHOLD: usize = 1024 * 1024;

/// 发布参数
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// 每个资产同时上传的节点数
    pub max_concurrent_nodes: usize,
    /// 单次节点请求超时
    pub upload_timeout: Duration,
    /// 单个资产最大字节数
    pub max_payload_bytes: u64,
    /// 超过此大小的文件流式上传
    pub streaming_threshold: u64,
    /// 首个成功后是否取消其余节点
    pub cancel_losers: bool,
    /// 取消前的宽限时间
    pub loser_grace: Duration,
    pub retry: RetryPolicy,
    pub chunker: StreamChunker,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self::from_config(&PublishConfig::default())
    }
}

impl PublisherOptions {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            max_concurrent_nodes: config.max_concurrent_nodes.max(1),
            upload_timeout: config.upload_timeout(),
            max_payload_bytes: config.max_payload_bytes,
            streaming_threshold: config.streaming_threshold_bytes,
            cancel_losers: config.cancel_losers,
            loser_grace: config.loser_grace(),
            retry: config.retry.to_policy(),
            chunker: StreamChunker::new(config.chunk_size_bytes),
        }
    }
}

/// 单个节点的尝试结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub node: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// 最后一次请求的耗时（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// 请求次数（含重试）
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<NodeErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeAttempt {
    fn failed(node: String, attempts: u32, kind: NodeErrorKind, error: String) -> Self {
        Self {
            node,
            success: false,
            cid: None,
            latency_ms: None,
            attempts,
            error_kind: Some(kind),
            error: Some(error),
        }
    }

    fn to_failure(&self) -> Option<NodeFailure> {
        if self.success {
            return None;
        }
        Some(NodeFailure {
            node: self.node.clone(),
            kind: self.error_kind.unwrap_or(NodeErrorKind::Network),
            reason: self.error.clone().unwrap_or_default(),
        })
    }
}

/// 发布结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    /// 节点返回的内容标识
    pub hash: String,
    pub url: String,
    pub node: String,
    pub latency_ms: f64,
    /// 本地计算的内容哈希（缓存 key）
    pub content_hash: String,
    pub size: u64,
    pub all_results: Vec<NodeAttempt>,
    pub failed_nodes: Vec<NodeFailure>,
    #[serde(default)]
    pub from_cache: bool,
}

/// 冗余发布器
pub struct RedundantPublisher {
    client: Arc<dyn NodeClient>,
    registry: Arc<NodeHealthRegistry>,
    limiter: ConcurrencyLimiter,
    cache: Arc<ContentCache>,
    telemetry: Arc<TelemetryAggregator>,
    options: PublisherOptions,
    /// 内容哈希 → 正在进行的发布
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl RedundantPublisher {
    pub fn new(
        client: Arc<dyn NodeClient>,
        registry: Arc<NodeHealthRegistry>,
        limiter: ConcurrencyLimiter,
        cache: Arc<ContentCache>,
        telemetry: Arc<TelemetryAggregator>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            client,
            registry,
            limiter,
            cache,
            telemetry,
            options,
            in_flight: DashMap::new(),
        }
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.options.retry = retry;
    }

    /// 读取负载并计算内容哈希
    ///
    /// 大文件只流式计算哈希，上传时再按块读取
    async fn prepare(
        &self,
        asset: &Asset,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<(String, UploadBody), PublishError> {
        match &asset.source {
            AssetSource::Bytes(bytes) => {
                let hash = if bytes.len() >= OFFLOAD_HASH_THRESHOLD {
                    ContentHasher::hash_bytes_offloaded(bytes.clone()).await
                } else {
                    ContentHasher::hash_bytes(bytes)
                };
                Ok((hash, UploadBody::Bytes(bytes.clone())))
            }
            AssetSource::File(path) if size > self.options.streaming_threshold => {
                let (hash, _) =
                    ContentHasher::hash_file(path, &self.options.chunker, cancel).await?;
                Ok((
                    hash,
                    UploadBody::File {
                        path: path.clone(),
                        size,
                        chunk_size: self.options.chunker.chunk_size(),
                    },
                ))
            }
            AssetSource::File(path) => {
                let bytes = Arc::new(tokio::fs::read(path).await?);
                Ok((ContentHasher::hash_bytes(&bytes), UploadBody::Bytes(bytes)))
            }
        }
    }

    /// 上传单个资产
    pub async fn upload_file(
        &self,
        asset: &Asset,
        cancel: &CancellationToken,
    ) -> Result<PublishResult, PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        let size = asset.size().await?;
        if size == 0 {
            return Err(PublishError::PayloadRejected {
                node: None,
                reason: format!("{} 是空负载", asset.name),
            });
        }
        if size > self.options.max_payload_bytes {
            return Err(PublishError::PayloadRejected {
                node: None,
                reason: format!(
                    "{} 大小 {} 超出上限 {}",
                    asset.name, size, self.options.max_payload_bytes
                ),
            });
        }

        let (content_hash, body) = self.prepare(asset, size, cancel).await?;

        let outcome = {
            let flight = self.in_flight.entry(content_hash.clone()).or_default().clone();
            let guard = tokio::select! {
                _ = cancel.cancelled() => None,
                guard = flight.lock_owned() => Some(guard),
            };
            match guard {
                Some(_guard) => {
                    self.publish_exclusive(asset, &content_hash, size, body, cancel)
                        .await
                }
                None => Err(PublishError::Cancelled),
            }
        };
        self.in_flight
            .remove_if(&content_hash, |_, flight| Arc::strong_count(flight) == 1);
        outcome
    }

    /// 持有该内容的发布权后执行：查缓存，未命中再上传
    async fn publish_exclusive(
        &self,
        asset: &Asset,
        content_hash: &str,
        size: u64,
        body: UploadBody,
        cancel: &CancellationToken,
    ) -> Result<PublishResult, PublishError> {
        if let Some(mut cached) = self.cache.get_json::<PublishResult>(&content_hash) {
            self.telemetry.record_cache_hit();
            info!(
                "缓存命中，跳过上传: name={}, hash={}, cid={}",
                asset.name, content_hash, cached.hash
            );
            cached.from_cache = true;
            return Ok(cached);
        }
        self.telemetry.record_cache_miss();

        let request = NodeUploadRequest {
            file_name: asset.name.clone(),
            body,
            metadata: asset.metadata.clone(),
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PublishError::Cancelled),
            permit = self.limiter.acquire() => permit,
        };
        // 排队时间不计入上传耗时
        let started = Instant::now();

        // 全部健康节点按延迟排序，前 K 个先上，其余作为替补
        let candidates = self.registry.best_nodes(usize::MAX);
        if candidates.is_empty() {
            return Err(PublishError::NoAvailableNodes);
        }

        debug!(
            "开始冗余上传: name={}, size={}, 候选节点={:?}",
            asset.name, size, candidates
        );
        let attempts = self.race(candidates, request, cancel).await;
        permit.release();

        let outcome = self.settle(asset, content_hash, size, attempts, cancel);
        match &outcome {
            Ok(result) => {
                self.telemetry
                    .record_successful_upload(size, started.elapsed().as_millis() as u64);
                let options = CacheOptions::default().with_tags(
                    std::iter::once(asset.name.clone()).chain(asset.metadata.search_tokens()),
                );
                if let Err(e) = self.cache.set_json(content_hash, result, options) {
                    warn!("发布结果写入缓存失败: hash={}, 原因={}", content_hash, e);
                }
                info!(
                    "上传成功: name={}, node={}, cid={}, 延迟={:.0}ms",
                    asset.name, result.node, result.hash, result.latency_ms
                );
            }
            Err(e) => {
                self.telemetry.record_failed_upload(size, &e.to_string());
                error!("上传失败: name={}, 原因={}", asset.name, e);
            }
        }
        outcome
    }

    /// 从所有节点结果中选出胜者
    fn settle(
        &self,
        asset: &Asset,
        content_hash: &str,
        size: u64,
        attempts: Vec<NodeAttempt>,
        cancel: &CancellationToken,
    ) -> Result<PublishResult, PublishError> {
        let winner = attempts
            .iter()
            .filter(|a| a.success)
            .min_by(|a, b| {
                let a = a.latency_ms.unwrap_or(f64::INFINITY);
                let b = b.latency_ms.unwrap_or(f64::INFINITY);
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        let failures: Vec<NodeFailure> = attempts.iter().filter_map(|a| a.to_failure()).collect();

        if let Some(rejected) = failures.iter().find(|f| f.kind.is_payload_rejection()) {
            if winner.is_none() {
                return Err(PublishError::PayloadRejected {
                    node: Some(rejected.node.clone()),
                    reason: rejected.reason.clone(),
                });
            }
        }

        let winner = match winner {
            Some(winner) => winner,
            None if cancel.is_cancelled() => return Err(PublishError::Cancelled),
            None => {
                warn!(
                    "所有节点上传失败: name={}, 失败数={}",
                    asset.name,
                    failures.len()
                );
                return Err(PublishError::from_node_failures(failures));
            }
        };

        let cid = winner.cid.clone().unwrap_or_default();
        Ok(PublishResult {
            success: true,
            url: self.client.public_url(&winner.node, &cid),
            hash: cid,
            node: winner.node.clone(),
            latency_ms: winner.latency_ms.unwrap_or_default(),
            content_hash: content_hash.to_string(),
            size,
            all_results: attempts,
            failed_nodes: failures,
            from_cache: false,
        })
    }

    fn spawn_attempt(
        &self,
        join_set: &mut JoinSet<NodeAttempt>,
        node: String,
        request: &Arc<NodeUploadRequest>,
        race_cancel: &CancellationToken,
    ) {
        join_set.spawn(attempt_node(
            self.client.clone(),
            self.registry.clone(),
            self.telemetry.clone(),
            node,
            request.clone(),
            self.options.upload_timeout,
            self.options.retry.clone(),
            race_cancel.child_token(),
        ));
    }

    /// 向前 K 个候选节点并发上传，等待全部结束
    ///
    /// 不可达的节点由替补顶上
    async fn race(
        &self,
        candidates: Vec<String>,
        request: NodeUploadRequest,
        cancel: &CancellationToken,
    ) -> Vec<NodeAttempt> {
        let race_cancel = cancel.child_token();
        let request = Arc::new(request);
        let mut pending: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<NodeAttempt> = JoinSet::new();

        let mut reserve: VecDeque<String> = candidates.into();
        let first_wave = self.options.max_concurrent_nodes.min(reserve.len());
        for node in reserve.drain(..first_wave).collect::<Vec<_>>() {
            pending.insert(node.clone());
            self.spawn_attempt(&mut join_set, node, &request, &race_cancel);
        }

        let mut results = Vec::with_capacity(pending.len());
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let joined = match grace_deadline {
                Some(deadline) if !race_cancel.is_cancelled() => {
                    tokio::select! {
                        joined = join_set.join_next() => joined,
                        _ = tokio::time::sleep_until(deadline) => {
                            debug!("宽限时间已到，取消其余节点的上传");
                            race_cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => join_set.join_next().await,
            };

            let attempt = match joined {
                None => break,
                Some(Ok(attempt)) => attempt,
                Some(Err(e)) => {
                    error!("节点上传任务异常退出: {}", e);
                    continue;
                }
            };
            pending.remove(&attempt.node);

            if attempt.success && self.options.cancel_losers && grace_deadline.is_none() {
                grace_deadline = Some(Instant::now() + self.options.loser_grace);
            }
            if attempt
                .error_kind
                .map(|kind| kind.is_payload_rejection())
                .unwrap_or(false)
            {
                warn!("节点 {} 拒绝负载，取消其余节点", attempt.node);
                race_cancel.cancel();
            }
            if attempt.error_kind == Some(NodeErrorKind::Unreachable)
                && grace_deadline.is_none()
                && !race_cancel.is_cancelled()
            {
                if let Some(next) = reserve.pop_front() {
                    info!("节点 {} 不可达，改用候选节点 {}", attempt.node, next);
                    pending.insert(next.clone());
                    self.spawn_attempt(&mut join_set, next, &request, &race_cancel);
                }
            }

            results.push(attempt);
        }

        // 异常退出的任务也要出现在结果里
        for node in pending {
            results.push(NodeAttempt::failed(
                node,
                0,
                NodeErrorKind::Network,
                "上传任务异常退出".to_string(),
            ));
        }

        results
    }

    /// 批量上传，结果与输入按下标对齐
    pub async fn upload_batch(
        &self,
        assets: &[Asset],
        cancel: &CancellationToken,
    ) -> Vec<Result<PublishResult, PublishError>> {
        futures::future::join_all(assets.iter().map(|asset| self.upload_file(asset, cancel)))
            .await
    }
}

/// 单个节点的上传（含重试）
#[allow(clippy::too_many_arguments)]
async fn attempt_node(
    client: Arc<dyn NodeClient>,
    registry: Arc<NodeHealthRegistry>,
    telemetry: Arc<TelemetryAggregator>,
    node: String,
    request: Arc<NodeUploadRequest>,
    timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> NodeAttempt {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return NodeAttempt::failed(
                node,
                attempt - 1,
                NodeErrorKind::Cancelled,
                "请求已取消".to_string(),
            );
        }

        let started = Instant::now();
        let result = client.upload(&node, &request, timeout, &cancel).await;
        let latency = started.elapsed();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        match result {
            Ok(response) => {
                telemetry.record_network_request(latency_ms, true);
                registry.record_success(&node, latency);
                debug!(
                    "节点上传成功: node={}, cid={}, 耗时={:.0}ms, 第{}次",
                    node, response.cid, latency_ms, attempt
                );
                return NodeAttempt {
                    node,
                    success: true,
                    cid: Some(response.cid),
                    latency_ms: Some(latency_ms),
                    attempts: attempt,
                    error_kind: None,
                    error: None,
                };
            }
            Err(e) if e.kind == NodeErrorKind::Cancelled => {
                return NodeAttempt::failed(node, attempt, e.kind, e.message);
            }
            Err(e) => {
                telemetry.record_network_request(latency_ms, false);
                registry.record_failure(&node, e.kind);

                if !retry.should_retry(attempt, e.kind) {
                    debug!(
                        "节点上传失败，不再重试: node={}, 第{}次, 错误={}",
                        node, attempt, e
                    );
                    return NodeAttempt::failed(node, attempt, e.kind, e.message);
                }

                let delay = retry.delay_for(attempt, e.kind);
                warn!(
                    "节点上传失败，{}ms 后重试: node={}, 第{}次, 错误={}",
                    delay.as_millis(),
                    node,
                    attempt,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return NodeAttempt::failed(
                            node,
                            attempt,
                            NodeErrorKind::Cancelled,
                            "重试等待期间被取消".to_string(),
                        );
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock::{MockNodeClient, MockOutcome};
    use crate::storage::types::AssetMetadata;

    const N1: &str = "http://node1";
    const N2: &str = "http://node2";
    const N3: &str = "http://node3";

    struct Fixture {
        client: Arc<MockNodeClient>,
        registry: Arc<NodeHealthRegistry>,
        limiter: ConcurrencyLimiter,
        cache: Arc<ContentCache>,
        telemetry: Arc<TelemetryAggregator>,
    }

    impl Fixture {
        fn new(nodes: &[&str]) -> Self {
            Self {
                client: Arc::new(MockNodeClient::new()),
                registry: Arc::new(NodeHealthRegistry::new(
                    nodes.iter().map(|n| n.to_string()).collect(),
                    Duration::from_secs(5),
                    3,
                )),
                limiter: ConcurrencyLimiter::new(3),
                cache: Arc::new(ContentCache::new(
                    10 * 1024 * 1024,
                    100,
                    Duration::from_secs(3600),
                )),
                telemetry: Arc::new(TelemetryAggregator::default()),
            }
        }

        fn publisher(&self, options: PublisherOptions) -> RedundantPublisher {
            RedundantPublisher::new(
                self.client.clone(),
                self.registry.clone(),
                self.limiter.clone(),
                self.cache.clone(),
                self.telemetry.clone(),
                options,
            )
        }
    }

    fn options(cancel_losers: bool) -> PublisherOptions {
        PublisherOptions {
            max_concurrent_nodes: 3,
            upload_timeout: Duration::from_secs(10),
            cancel_losers,
            loser_grace: Duration::from_millis(250),
            retry: RetryPolicy::new(2, Duration::from_millis(100)),
            ..Default::default()
        }
    }

    fn asset(name: &str, bytes: &[u8]) -> Asset {
        Asset::from_bytes(name, bytes.to_vec(), AssetMetadata::named(name))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_success_is_enough() {
        let fixture = Fixture::new(&[N1, N2, N3]);
        fixture.client.script(
            N1,
            vec![MockOutcome::Fail(NodeErrorKind::ServerError, Duration::from_millis(5))],
        );
        fixture.client.script(
            N2,
            vec![MockOutcome::Fail(NodeErrorKind::Unreachable, Duration::from_millis(5))],
        );
        fixture
            .client
            .script(N3, vec![MockOutcome::Success(Duration::from_millis(40))]);

        let publisher = fixture.publisher(options(false));
        let result = publisher
            .upload_file(&asset("a.png", b"payload-a"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.node, N3);
        assert!([N1, N2, N3].contains(&result.node.as_str()));
        assert_eq!(result.hash, "cid-a.png");
        assert_eq!(result.url, "http://node3/ipfs/cid-a.png");
        assert_eq!(result.all_results.len(), 3);
        assert_eq!(result.failed_nodes.len(), 2);

        // 5xx 按策略重试一次，不可达不重试
        assert_eq!(fixture.client.upload_calls(N1), 2);
        assert_eq!(fixture.client.upload_calls(N2), 1);
        assert!(!fixture.registry.record(N2).unwrap().healthy);
        assert_eq!(fixture.limiter.holders(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_nodes_fail() {
        let fixture = Fixture::new(&[N1, N2, N3]);
        for node in [N1, N2, N3] {
            fixture.client.script(
                node,
                vec![MockOutcome::Fail(NodeErrorKind::ServerError, Duration::from_millis(5))],
            );
        }

        let publisher = fixture.publisher(options(true));
        let err = publisher
            .upload_file(&asset("b.png", b"payload-b"), &CancellationToken::new())
            .await
            .unwrap_err();

        let failed: Vec<&str> = err.failed_nodes().iter().map(|f| f.node.as_str()).collect();
        assert_eq!(failed.len(), 3);
        for node in [N1, N2, N3] {
            assert!(failed.contains(&node));
        }
        assert!(matches!(err, PublishError::AllNodesFailed { .. }));
        assert_eq!(fixture.cache.len(), 0);
        assert_eq!(fixture.telemetry.current().uploads.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_content_hits_cache() {
        let fixture = Fixture::new(&[N1, N2]);
        let publisher = fixture.publisher(options(false));
        let cancel = CancellationToken::new();

        let first = publisher
            .upload_file(&asset("one.png", b"same bytes"), &cancel)
            .await
            .unwrap();
        let calls = fixture.client.total_upload_calls();
        assert_eq!(calls, 2);

        // 名称不同、内容相同
        let second = publisher
            .upload_file(&asset("two.png", b"same bytes"), &cancel)
            .await
            .unwrap();

        assert!(second.from_cache);
        assert_eq!(second.hash, first.hash);
        assert_eq!(fixture.client.total_upload_calls(), calls);

        let snapshot = fixture.telemetry.current();
        assert_eq!(snapshot.cache.hits, 1);
        assert_eq!(snapshot.cache.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowest_latency_wins_over_first_settled() {
        let fixture = Fixture::new(&[N1, N2]);
        // N1 第一次超时，重试后 5ms 成功；N2 50ms 成功但先结束
        fixture.client.script(
            N1,
            vec![
                MockOutcome::Fail(NodeErrorKind::Timeout, Duration::from_millis(5)),
                MockOutcome::Success(Duration::from_millis(5)),
            ],
        );
        fixture
            .client
            .script(N2, vec![MockOutcome::Success(Duration::from_millis(50))]);

        let publisher = fixture.publisher(options(false));
        let result = publisher
            .upload_file(&asset("c.png", b"payload-c"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.node, N1);
        assert!(result.latency_ms < 50.0);
        assert!(result.failed_nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_losers_cancelled_after_grace() {
        let fixture = Fixture::new(&[N1, N2]);
        fixture
            .client
            .script(N1, vec![MockOutcome::Success(Duration::from_millis(10))]);
        fixture.client.script(N2, vec![MockOutcome::Hang]);

        let publisher = fixture.publisher(options(true));
        let started = Instant::now();
        let result = publisher
            .upload_file(&asset("d.png", b"payload-d"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.node, N1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fixture.client.cancelled_calls(), 1);
        assert_eq!(result.failed_nodes.len(), 1);
        assert_eq!(result.failed_nodes[0].kind, NodeErrorKind::Cancelled);
        // 被取消不算节点故障
        assert!(fixture.registry.record(N2).unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient_per_node() {
        let fixture = Fixture::new(&[N1, N2]);
        fixture
            .client
            .script(N1, vec![MockOutcome::Success(Duration::from_millis(10))]);
        fixture.client.script(N2, vec![MockOutcome::Hang]);

        let mut opts = options(false);
        opts.upload_timeout = Duration::from_secs(1);
        opts.retry = RetryPolicy::no_retry();
        let publisher = fixture.publisher(opts);

        let result = publisher
            .upload_file(&asset("e.png", b"payload-e"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.node, N1);
        assert_eq!(result.failed_nodes[0].kind, NodeErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_rejection_fails_fast() {
        let fixture = Fixture::new(&[N1, N2]);
        fixture.client.script(
            N1,
            vec![MockOutcome::Fail(NodeErrorKind::PayloadTooLarge, Duration::from_millis(5))],
        );
        fixture.client.script(N2, vec![MockOutcome::Hang]);

        let publisher = fixture.publisher(options(false));
        let started = Instant::now();
        let err = publisher
            .upload_file(&asset("f.png", b"payload-f"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::PayloadRejected { node: Some(ref n), .. } if n == N1));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fixture.client.upload_calls(N1), 1);
        assert_eq!(fixture.client.cancelled_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_and_oversized_payloads_rejected_locally() {
        let fixture = Fixture::new(&[N1]);
        let mut opts = options(true);
        opts.max_payload_bytes = 8;
        let publisher = fixture.publisher(opts);
        let cancel = CancellationToken::new();

        let err = publisher
            .upload_file(&asset("empty", b""), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::PayloadRejected { node: None, .. }));

        let err = publisher
            .upload_file(&asset("big", b"0123456789"), &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(fixture.client.total_upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_nodes_configured() {
        let fixture = Fixture::new(&[]);
        let publisher = fixture.publisher(options(true));
        let err = publisher
            .upload_file(&asset("g", b"x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NoAvailableNodes));
        assert_eq!(fixture.limiter.holders(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation() {
        let fixture = Fixture::new(&[N1]);
        fixture.client.script(N1, vec![MockOutcome::Hang]);
        let publisher = fixture.publisher(options(true));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = publisher
            .upload_file(&asset("h", b"payload-h"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_results_are_index_aligned() {
        let fixture = Fixture::new(&[N1, N2]);
        fixture.client.fail_file("bad.png");
        let publisher = fixture.publisher(options(true));

        let assets = vec![
            asset("ok1.png", b"one"),
            asset("bad.png", b"two"),
            asset("ok2.png", b"three"),
        ];
        let results = publisher
            .upload_batch(&assets, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().hash, "cid-ok1.png");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().hash, "cid-ok2.png");
        assert_eq!(fixture.limiter.holders(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_content_in_one_batch_uploads_once() {
        let fixture = Fixture::new(&[N1, N2]);
        let publisher = fixture.publisher(options(false));

        let assets = vec![asset("first.png", b"same"), asset("second.png", b"same")];
        let results = publisher
            .upload_batch(&assets, &CancellationToken::new())
            .await;

        assert_eq!(fixture.client.total_upload_calls(), 2);
        let from_cache: Vec<bool> = results
            .iter()
            .map(|r| r.as_ref().unwrap().from_cache)
            .collect();
        assert_eq!(from_cache, vec![false, true]);
        assert_eq!(
            results[0].as_ref().unwrap().hash,
            results[1].as_ref().unwrap().hash
        );
        assert_eq!(fixture.cache.len(), 1);
        assert!(publisher.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_waits_then_retries_after_failure() {
        let fixture = Fixture::new(&[N1]);
        fixture.client.script(
            N1,
            vec![
                MockOutcome::Fail(NodeErrorKind::BadRequest, Duration::from_millis(5)),
                MockOutcome::Success(Duration::from_millis(5)),
            ],
        );
        let publisher = fixture.publisher(options(false));

        let assets = vec![asset("first.png", b"same"), asset("second.png", b"same")];
        let results = publisher
            .upload_batch(&assets, &CancellationToken::new())
            .await;

        // 前一个失败不写缓存，后一个自己上传
        assert!(results[0].is_err());
        let second = results[1].as_ref().unwrap();
        assert!(!second.from_cache);
        assert_eq!(fixture.client.upload_calls(N1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_candidates_are_replaced() {
        const N4: &str = "http://node4";
        const N5: &str = "http://node5";
        let fixture = Fixture::new(&[N1, N2, N3, N4, N5]);
        for node in [N1, N2] {
            fixture.client.script(
                node,
                vec![MockOutcome::Fail(NodeErrorKind::Unreachable, Duration::from_millis(5))],
            );
        }
        fixture.client.script(
            N3,
            vec![MockOutcome::Fail(NodeErrorKind::ServerError, Duration::from_millis(5))],
        );

        let publisher = fixture.publisher(options(false));
        let result = publisher
            .upload_file(&asset("i.png", b"payload-i"), &CancellationToken::new())
            .await
            .unwrap();

        assert!([N4, N5].contains(&result.node.as_str()));
        assert_eq!(result.all_results.len(), 5);
        // 不可达不重试，替补各上传一次
        assert_eq!(fixture.client.upload_calls(N1), 1);
        assert_eq!(fixture.client.upload_calls(N2), 1);
        assert_eq!(fixture.client.upload_calls(N3), 2);
        assert_eq!(fixture.client.upload_calls(N4), 1);
        assert_eq!(fixture.client.upload_calls(N5), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_failure_kinds() {
        let fixture = Fixture::new(&[N1]);
        fixture.client.script(
            N1,
            vec![MockOutcome::Fail(NodeErrorKind::ServerError, Duration::from_millis(5))],
        );
        let publisher = fixture.publisher(options(false));
        let err = publisher
            .upload_file(&asset("j.png", b"payload-j"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::TransientNetwork(ref f) if f.node == N1));
        assert_eq!(err.failed_nodes().len(), 1);
        assert_eq!(fixture.client.upload_calls(N1), 2);

        let fixture = Fixture::new(&[N2]);
        fixture.client.script(
            N2,
            vec![MockOutcome::Fail(NodeErrorKind::Unreachable, Duration::from_millis(5))],
        );
        let publisher = fixture.publisher(options(false));
        let err = publisher
            .upload_file(&asset("k.png", b"payload-k"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NodeUnhealthy(ref f) if f.node == N2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_duration_excludes_queueing() {
        let fixture = Fixture::new(&[N1]);
        fixture
            .client
            .script(N1, vec![MockOutcome::Success(Duration::from_millis(10))]);
        let limiter = ConcurrencyLimiter::new(1);
        let publisher = RedundantPublisher::new(
            fixture.client.clone(),
            fixture.registry.clone(),
            limiter.clone(),
            fixture.cache.clone(),
            fixture.telemetry.clone(),
            options(false),
        );

        let held = limiter.acquire().await;
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            held.release();
        });

        publisher
            .upload_file(&asset("l.png", b"payload-l"), &CancellationToken::new())
            .await
            .unwrap();
        release.await.unwrap();

        // 9 字节约 10ms 上传完成；排队的 5 秒不应计入
        let snapshot = fixture.telemetry.current();
        assert!(snapshot.throughput_bytes_per_sec > 100.0);
    }

    #[tokio::test]
    async fn test_large_file_is_streamed() {
        let fixture = Fixture::new(&[N1]);
        let mut opts = options(true);
        opts.streaming_threshold = 16;
        opts.chunker = StreamChunker::new(4096);
        let publisher = fixture.publisher(opts);

        let file = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![7u8; 10_000];
        std::fs::write(file.path(), &payload).unwrap();
        let asset = Asset::from_file(file.path().to_path_buf(), AssetMetadata::named("big"));

        let result = publisher
            .upload_file(&asset, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content_hash, ContentHasher::hash_bytes(&payload));
        assert_eq!(result.size, 10_000);
    }
}
