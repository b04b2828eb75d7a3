// 应用状态
//
// 组合根：所有共享组件在这里创建一次，通过 Arc 传给处理器与后台任务

use crate::cache::ContentCache;
use crate::common::limiter::ConcurrencyLimiter;
use crate::common::telemetry::TelemetryAggregator;
use crate::config::{AppConfig, CacheConfig};
use crate::device::capability::{Capabilities, CapabilityDetector};
use crate::device::optimizer::SafeOptimizer;
use crate::device::profile::{DeviceProfileResolver, DeviceSignals, Settings};
use crate::storage::client::{HttpNodeClient, NodeClient};
use crate::uploader::batch::AdaptiveBatchController;
use crate::uploader::chunk::StreamChunker;
use crate::uploader::engine::{PublisherOptions, RedundantPublisher};
use crate::uploader::health::NodeHealthRegistry;
use crate::uploader::manager::UploadOrchestrator;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub capabilities: Arc<Capabilities>,
    /// 本机设备信号（配置覆盖后）
    pub signals: DeviceSignals,
    /// 由设备画像解析出的运行参数
    pub settings: Settings,
    pub client: Arc<dyn NodeClient>,
    pub cache: Arc<ContentCache>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub limiter: ConcurrencyLimiter,
    pub registry: Arc<NodeHealthRegistry>,
    pub publisher: Arc<RedundantPublisher>,
    pub orchestrator: Arc<UploadOrchestrator>,
    pub optimizer: Arc<SafeOptimizer>,
    /// 后台任务的关闭信号
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 使用 HTTP 节点客户端和本机探测到的能力创建状态
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let chunker = StreamChunker::new(config.publish.chunk_size_bytes);
        let client = HttpNodeClient::new(&config.nodes, chunker)?;
        Ok(Self::with_client(
            config,
            Arc::new(client),
            CapabilityDetector::detect(),
        ))
    }

    pub fn with_client(
        config: AppConfig,
        client: Arc<dyn NodeClient>,
        capabilities: Capabilities,
    ) -> Self {
        let signals = config
            .device
            .apply(DeviceSignals::from_capabilities(&capabilities));
        let settings = DeviceProfileResolver::resolve(&signals);
        info!(
            "设备画像: mobile={}, low_end={}, 网络={:?}, 批次={}, 并发={}",
            signals.is_mobile,
            signals.is_low_end,
            signals.connection,
            settings.batch_size,
            settings.max_concurrent
        );

        // 设备画像只会收紧配置给出的上限
        let cache = Arc::new(ContentCache::from_config(&CacheConfig {
            max_items: config.cache.max_items.min(settings.cache_item_budget),
            ..config.cache.clone()
        }));
        let telemetry = Arc::new(TelemetryAggregator::new(config.telemetry.history_capacity));
        let limiter = ConcurrencyLimiter::new(
            settings
                .max_concurrent
                .min(config.publish.max_concurrent)
                .max(1),
        );
        let registry = Arc::new(
            NodeHealthRegistry::from_config(&config.nodes).with_telemetry(telemetry.clone()),
        );

        let mut options = PublisherOptions::from_config(&config.publish);
        if settings.retry_attempts > options.retry.max_attempts() {
            options.retry = settings.retry_policy();
        }
        if settings.use_streaming {
            options.streaming_threshold = options
                .streaming_threshold
                .min(options.chunker.chunk_size() as u64);
        }

        let publisher = Arc::new(RedundantPublisher::new(
            client.clone(),
            registry.clone(),
            limiter.clone(),
            cache.clone(),
            telemetry.clone(),
            options,
        ));

        let optimizer = Arc::new(SafeOptimizer::for_images(capabilities.clone()));
        let controller = Arc::new(AdaptiveBatchController::with_initial(
            config.batch.clone(),
            settings.batch_size,
        ));
        let orchestrator = Arc::new(
            UploadOrchestrator::new(
                publisher.clone(),
                controller,
                cache.clone(),
                telemetry.clone(),
                settings.clone(),
            )
            .with_optimizer(optimizer.clone()),
        );

        Self {
            config: Arc::new(config),
            capabilities: Arc::new(capabilities),
            signals,
            settings,
            client,
            cache,
            telemetry,
            limiter,
            registry,
            publisher,
            orchestrator,
            optimizer,
            shutdown: CancellationToken::new(),
        }
    }

    /// 启动缓存清理与节点健康检查
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let sweeper = self
            .cache
            .clone()
            .spawn_sweeper(self.config.cache.sweep_interval(), self.shutdown.child_token());
        let health = self.registry.clone().spawn_health_loop(
            self.client.clone(),
            self.limiter.clone(),
            self.config.nodes.check_interval(),
            self.shutdown.child_token(),
        );
        vec![sweeper, health]
    }

    /// 通知后台任务退出
    pub fn shutdown(&self) {
        info!("正在停止后台任务...");
        self.shutdown.cancel();
    }
}
