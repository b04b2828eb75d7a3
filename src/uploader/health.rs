// 存储节点健康注册表
//
// 使用 DashMap 保存每个节点的记录，读写都是短暂的分片锁
//
// 功能：
// - 周期性探测所有节点（启动时一次，之后按固定间隔）
// - 按延迟升序挑选健康节点
// - 根据真实上传结果更新延迟（EWMA）与失败计数
// - 连续失败达到阈值（或节点不可达）时标记为不健康，延迟视为无穷大

use crate::common::limiter::ConcurrencyLimiter;
use crate::common::telemetry::TelemetryAggregator;
use crate::config::NodesConfig;
use crate::storage::client::NodeClient;
use crate::storage::types::NodeErrorKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// EWMA 系数：新值权重 0.15
const EWMA_ALPHA: f64 = 0.85;

/// 节点记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub endpoint: String,
    pub healthy: bool,
    /// 延迟（毫秒），None 表示未知或不可用（视为无穷大）
    pub latency_ms: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub failed_probes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl NodeRecord {
    fn new(endpoint: String) -> Self {
        // 首次探测前乐观地视为健康
        Self {
            endpoint,
            healthy: true,
            latency_ms: None,
            last_checked_at: None,
            consecutive_failures: 0,
            total_probes: 0,
            failed_probes: 0,
            last_error: None,
        }
    }

    fn mark_unhealthy(&mut self, reason: String) {
        self.healthy = false;
        self.latency_ms = None;
        self.last_error = Some(reason);
    }
}

/// 延迟比较：已知延迟排在未知之前
fn compare_latency(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// 节点健康注册表
#[derive(Debug)]
pub struct NodeHealthRegistry {
    /// 配置的节点顺序（不可变）
    endpoints: Vec<String>,
    records: DashMap<String, NodeRecord>,
    probe_timeout: Duration,
    failure_threshold: u32,
    telemetry: Option<Arc<TelemetryAggregator>>,
}

impl NodeHealthRegistry {
    pub fn new(endpoints: Vec<String>, probe_timeout: Duration, failure_threshold: u32) -> Self {
        let mut unique = Vec::with_capacity(endpoints.len());
        let records = DashMap::new();
        for endpoint in endpoints {
            if records.contains_key(&endpoint) {
                continue;
            }
            records.insert(endpoint.clone(), NodeRecord::new(endpoint.clone()));
            unique.push(endpoint);
        }

        Self {
            endpoints: unique,
            records,
            probe_timeout,
            failure_threshold: failure_threshold.max(1),
            telemetry: None,
        }
    }

    /// 探测结果同时计入网络请求统计
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryAggregator>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn from_config(config: &NodesConfig) -> Self {
        Self::new(
            config.endpoints.clone(),
            config.probe_timeout(),
            config.failure_threshold,
        )
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// 按配置顺序返回全部记录
    pub fn records(&self) -> Vec<NodeRecord> {
        self.endpoints
            .iter()
            .filter_map(|endpoint| self.records.get(endpoint).map(|r| r.clone()))
            .collect()
    }

    pub fn record(&self, endpoint: &str) -> Option<NodeRecord> {
        self.records.get(endpoint).map(|r| r.clone())
    }

    pub fn healthy_count(&self) -> usize {
        self.records.iter().filter(|r| r.healthy).count()
    }

    /// 探测所有节点，每次探测占用一个并发槽位
    pub async fn check_all(
        &self,
        client: &dyn NodeClient,
        limiter: &ConcurrencyLimiter,
    ) -> Vec<NodeRecord> {
        let probes = self.endpoints.iter().map(|endpoint| async move {
            let _permit = limiter.acquire().await;
            let started = Instant::now();
            let result = client.probe(endpoint, self.probe_timeout).await;
            if let Some(telemetry) = &self.telemetry {
                let latency_ms = match &result {
                    Ok(latency) => latency.as_secs_f64() * 1000.0,
                    Err(_) => started.elapsed().as_secs_f64() * 1000.0,
                };
                telemetry.record_network_request(latency_ms, result.is_ok());
            }
            (endpoint, result)
        });

        let results = futures::future::join_all(probes).await;
        let now = Utc::now();

        for (endpoint, result) in results {
            if let Some(mut record) = self.records.get_mut(endpoint) {
                record.total_probes += 1;
                record.last_checked_at = Some(now);

                match result {
                    Ok(latency) => {
                        if !record.healthy {
                            info!("节点恢复健康: {}, 延迟={:?}", endpoint, latency);
                        }
                        record.healthy = true;
                        record.latency_ms = Some(latency.as_secs_f64() * 1000.0);
                        record.consecutive_failures = 0;
                        record.last_error = None;
                    }
                    Err(e) => {
                        if record.healthy {
                            warn!("节点探测失败，标记为不健康: {}, 原因={}", endpoint, e);
                        }
                        record.failed_probes += 1;
                        record.consecutive_failures += 1;
                        record.mark_unhealthy(e.to_string());
                    }
                }
            }
        }

        let records = self.records();
        debug!(
            "节点探测完成: 健康 {}/{}",
            records.iter().filter(|r| r.healthy).count(),
            records.len()
        );
        records
    }

    /// 返回延迟最低的 count 个健康节点（升序）
    ///
    /// 只要存在健康节点就不会返回不健康节点；全部不健康时，
    /// 按连续失败次数最少的顺序返回，作为最后手段
    pub fn best_nodes(&self, count: usize) -> Vec<String> {
        let records = self.records();
        let mut healthy: Vec<&NodeRecord> = records.iter().filter(|r| r.healthy).collect();

        if healthy.is_empty() {
            let mut fallback: Vec<&NodeRecord> = records.iter().collect();
            fallback.sort_by_key(|r| r.consecutive_failures);
            if !fallback.is_empty() {
                warn!("没有健康节点，按失败次数回退选择");
            }
            return fallback
                .into_iter()
                .take(count)
                .map(|r| r.endpoint.clone())
                .collect();
        }

        // 稳定排序，延迟相同保持配置顺序
        healthy.sort_by(|a, b| compare_latency(a.latency_ms, b.latency_ms));
        healthy
            .into_iter()
            .take(count)
            .map(|r| r.endpoint.clone())
            .collect()
    }

    /// 真实上传成功：EWMA 更新延迟，清零失败计数
    pub fn record_success(&self, endpoint: &str, latency: Duration) {
        if let Some(mut record) = self.records.get_mut(endpoint) {
            let sample = latency.as_secs_f64() * 1000.0;
            record.latency_ms = Some(match record.latency_ms {
                Some(old) => old * EWMA_ALPHA + sample * (1.0 - EWMA_ALPHA),
                None => sample,
            });
            record.consecutive_failures = 0;
            if !record.healthy {
                info!("节点上传成功，恢复健康: {}", endpoint);
                record.healthy = true;
                record.last_error = None;
            }
        }
    }

    /// 真实上传失败
    ///
    /// 只有说明节点本身有问题的错误才计数；不可达直接标记不健康
    pub fn record_failure(&self, endpoint: &str, kind: NodeErrorKind) {
        if !kind.indicates_unhealthy() {
            return;
        }

        if let Some(mut record) = self.records.get_mut(endpoint) {
            record.consecutive_failures += 1;
            let should_mark = kind == NodeErrorKind::Unreachable
                || record.consecutive_failures >= self.failure_threshold;

            if should_mark && record.healthy {
                warn!(
                    "节点连续失败 {} 次，标记为不健康: {}, 最后错误={:?}",
                    record.consecutive_failures, endpoint, kind
                );
                record.mark_unhealthy(format!("{:?}", kind));
            }
        }
    }

    /// 启动后台探测任务：立即探测一次，之后按间隔重复
    pub fn spawn_health_loop(
        self: Arc<Self>,
        client: Arc<dyn NodeClient>,
        limiter: ConcurrencyLimiter,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("节点健康检查任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.check_all(client.as_ref(), &limiter) => {}
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock::MockNodeClient;

    fn endpoints(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("http://node{}", i)).collect()
    }

    fn registry(n: usize) -> NodeHealthRegistry {
        NodeHealthRegistry::new(endpoints(n), Duration::from_secs(5), 3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_nodes_skips_unhealthy() {
        let registry = registry(5);
        let client = MockNodeClient::new();
        client.set_probe("http://node1", Ok(Duration::from_millis(40)));
        client.set_probe("http://node2", Err(NodeErrorKind::Unreachable));
        client.set_probe("http://node3", Ok(Duration::from_millis(10)));
        client.set_probe("http://node4", Err(NodeErrorKind::ServerError));
        client.set_probe("http://node5", Ok(Duration::from_millis(25)));

        let limiter = ConcurrencyLimiter::new(2);
        let records = registry.check_all(&client, &limiter).await;
        assert_eq!(records.len(), 5);
        assert_eq!(registry.healthy_count(), 3);
        assert_eq!(limiter.holders(), 0);

        let best = registry.best_nodes(3);
        assert_eq!(
            best,
            vec!["http://node3", "http://node5", "http://node1"]
        );

        let record = registry.record("http://node2").unwrap();
        assert!(!record.healthy);
        assert!(record.latency_ms.is_none());
        assert_eq!(record.failed_probes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_nodes_does_not_pad_with_unhealthy() {
        let registry = registry(3);
        let client = MockNodeClient::new();
        client.set_probe("http://node2", Err(NodeErrorKind::Timeout));

        registry
            .check_all(&client, &ConcurrencyLimiter::new(3))
            .await;
        let best = registry.best_nodes(3);
        assert_eq!(best.len(), 2);
        assert!(!best.contains(&"http://node2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_health_check_marks_unhealthy() {
        let registry = NodeHealthRegistry::new(endpoints(2), Duration::from_millis(100), 3);
        let client = MockNodeClient::new();
        client.set_probe("http://node1", Ok(Duration::from_secs(10)));

        registry
            .check_all(&client, &ConcurrencyLimiter::new(2))
            .await;
        assert!(!registry.record("http://node1").unwrap().healthy);
        assert_eq!(registry.best_nodes(2), vec!["http://node2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_checks_are_counted_as_network_requests() {
        let telemetry = Arc::new(TelemetryAggregator::default());
        let registry = registry(3).with_telemetry(telemetry.clone());
        let client = MockNodeClient::new();
        client.set_probe("http://node1", Ok(Duration::from_millis(20)));
        client.set_probe("http://node2", Err(NodeErrorKind::Unreachable));

        registry
            .check_all(&client, &ConcurrencyLimiter::new(3))
            .await;

        let network = telemetry.current().network;
        assert_eq!(network.requests, 3);
        assert_eq!(network.errors, 1);
        assert!(network.avg_latency_ms > 0.0);
    }

    #[test]
    fn test_unknown_latency_sorts_last() {
        let registry = registry(3);
        registry.record_success("http://node3", Duration::from_millis(20));
        registry.record_success("http://node2", Duration::from_millis(80));

        assert_eq!(
            registry.best_nodes(3),
            vec!["http://node3", "http://node2", "http://node1"]
        );
    }

    #[test]
    fn test_failure_threshold() {
        let registry = registry(2);
        registry.record_failure("http://node1", NodeErrorKind::ServerError);
        registry.record_failure("http://node1", NodeErrorKind::Timeout);
        assert!(registry.record("http://node1").unwrap().healthy);

        registry.record_failure("http://node1", NodeErrorKind::ServerError);
        assert!(!registry.record("http://node1").unwrap().healthy);

        // 负载问题不影响节点健康
        registry.record_failure("http://node2", NodeErrorKind::PayloadTooLarge);
        registry.record_failure("http://node2", NodeErrorKind::PayloadTooLarge);
        registry.record_failure("http://node2", NodeErrorKind::PayloadTooLarge);
        assert_eq!(registry.record("http://node2").unwrap().consecutive_failures, 0);

        // 不可达立即标记
        registry.record_failure("http://node2", NodeErrorKind::Unreachable);
        assert!(!registry.record("http://node2").unwrap().healthy);
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_fewest_failures() {
        let registry = registry(3);
        for _ in 0..5 {
            registry.record_failure("http://node1", NodeErrorKind::Unreachable);
        }
        registry.record_failure("http://node2", NodeErrorKind::Unreachable);
        for _ in 0..3 {
            registry.record_failure("http://node3", NodeErrorKind::Unreachable);
        }
        assert_eq!(registry.healthy_count(), 0);
        assert_eq!(
            registry.best_nodes(2),
            vec!["http://node2", "http://node3"]
        );
    }

    #[test]
    fn test_ewma_latency() {
        let registry = registry(1);
        registry.record_success("http://node1", Duration::from_millis(100));
        registry.record_success("http://node1", Duration::from_millis(200));
        let latency = registry.record("http://node1").unwrap().latency_ms.unwrap();
        assert!((latency - 115.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_at_startup_and_on_interval() {
        let registry = Arc::new(registry(2));
        let client = Arc::new(MockNodeClient::new());
        let cancel = CancellationToken::new();

        let handle = registry.clone().spawn_health_loop(
            client.clone(),
            ConcurrencyLimiter::new(2),
            Duration::from_secs(60),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.probe_calls(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.probe_calls(), 4);

        cancel.cancel();
        handle.await.unwrap();
    }
}
