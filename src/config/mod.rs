// 配置管理模块

use crate::common::retry::RetryPolicy;
use crate::device::profile::{ConnectionClass, DeviceSignals};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 诊断服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 存储节点配置
    #[serde(default)]
    pub nodes: NodesConfig,
    /// 发布配置
    #[serde(default)]
    pub publish: PublishConfig,
    /// 内容缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 自适应批次配置
    #[serde(default)]
    pub batch: BatchConfig,
    /// 遥测配置
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// 设备信号覆盖
    #[serde(default)]
    pub device: DeviceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 诊断服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_server_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    18980
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// 存储节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    /// 节点地址列表
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// 健康探测对象路径（约定存在的小对象）
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// 探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 探测间隔（秒）
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// 上传接口路径
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    /// 访问 URL 模板，支持 {endpoint} 与 {cid}
    #[serde(default = "default_public_url_template")]
    pub public_url_template: String,
    /// 连续失败多少次判定节点不健康
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_endpoints() -> Vec<String> {
    vec![
        "http://127.0.0.1:5001".to_string(),
        "http://127.0.0.1:5002".to_string(),
        "http://127.0.0.1:5003".to_string(),
    ]
}

fn default_probe_path() -> String {
    "/ipfs/bafkqaaa".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_upload_path() -> String {
    "/api/v0/add".to_string()
}

fn default_public_url_template() -> String {
    "{endpoint}/ipfs/{cid}".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            probe_path: default_probe_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            upload_path: default_upload_path(),
            public_url_template: default_public_url_template(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl NodesConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// 重试配置（序列化形式，转换为 RetryPolicy 使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 退避倍数
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动比例（0-1）
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_retry_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            multiplier: default_retry_multiplier(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_multiplier(self.multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

/// 发布配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// 每个资产同时上传的节点数
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// 全局同时进行的网络操作数（ConcurrencyLimiter 容量）
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单次上传超时（秒）
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// 单个资产最大字节数（超出直接拒绝）
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    /// 超过此大小的文件走流式上传
    #[serde(default = "default_streaming_threshold_bytes")]
    pub streaming_threshold_bytes: u64,
    /// 流式分块大小
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// 首个节点成功后是否取消其余节点
    #[serde(default = "default_cancel_losers")]
    pub cancel_losers: bool,
    /// 取消前给其余节点的宽限时间（毫秒）
    #[serde(default = "default_loser_grace_ms")]
    pub loser_grace_ms: u64,
    /// 重试策略
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent_nodes() -> usize {
    3
}

fn default_max_concurrent() -> usize {
    3
}

fn default_upload_timeout_secs() -> u64 {
    60
}

fn default_max_payload_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_streaming_threshold_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_chunk_size_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_cancel_losers() -> bool {
    true
}

fn default_loser_grace_ms() -> u64 {
    250
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            max_concurrent: default_max_concurrent(),
            upload_timeout_secs: default_upload_timeout_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            streaming_threshold_bytes: default_streaming_threshold_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            cancel_losers: default_cancel_losers(),
            loser_grace_ms: default_loser_grace_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl PublishConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs.max(1))
    }

    pub fn loser_grace(&self) -> Duration {
        Duration::from_millis(self.loser_grace_ms)
    }
}

/// 内容缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 内存预算（字节）
    #[serde(default = "default_cache_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// 条目数上限
    #[serde(default = "default_cache_max_items")]
    pub max_items: usize,
    /// 默认 TTL（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 是否压缩
    #[serde(default = "default_cache_compression")]
    pub compression: bool,
    /// 超过此大小才压缩（字节）
    #[serde(default = "default_cache_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// 压缩等级 0-9
    #[serde(default = "default_cache_compression_level")]
    pub compression_level: u32,
    /// 过期清理间隔（秒）
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_max_memory_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_cache_max_items() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_compression() -> bool {
    true
}

fn default_cache_compression_threshold() -> usize {
    1024
}

fn default_cache_compression_level() -> u32 {
    6
}

fn default_cache_sweep_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_cache_max_memory_bytes(),
            max_items: default_cache_max_items(),
            default_ttl_secs: default_cache_ttl_secs(),
            compression: default_cache_compression(),
            compression_threshold_bytes: default_cache_compression_threshold(),
            compression_level: default_cache_compression_level(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 自适应批次配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_initial")]
    pub initial_size: usize,
    #[serde(default = "default_batch_min")]
    pub min_size: usize,
    #[serde(default = "default_batch_max")]
    pub max_size: usize,
    /// 滚动平均吞吐超过此值（文件/秒）时扩大批次
    #[serde(default = "default_batch_increase_threshold")]
    pub increase_threshold: f64,
    /// 滚动平均吞吐低于此值（文件/秒）时缩小批次
    #[serde(default = "default_batch_decrease_threshold")]
    pub decrease_threshold: f64,
    /// 扩大步长
    #[serde(default = "default_batch_increase_step")]
    pub increase_step: usize,
    /// 缩小步长（小于扩大步长）
    #[serde(default = "default_batch_decrease_step")]
    pub decrease_step: usize,
    /// 批次硬失败时的缩小步长
    #[serde(default = "default_batch_failure_step")]
    pub failure_step: usize,
    /// 滚动窗口大小
    #[serde(default = "default_batch_window")]
    pub window: usize,
    /// 失败比例达到此值视为硬失败
    #[serde(default = "default_batch_hard_failure_ratio")]
    pub hard_failure_ratio: f64,
}

fn default_batch_initial() -> usize {
    10
}

fn default_batch_min() -> usize {
    5
}

fn default_batch_max() -> usize {
    50
}

fn default_batch_increase_threshold() -> f64 {
    2.0
}

fn default_batch_decrease_threshold() -> f64 {
    0.5
}

fn default_batch_increase_step() -> usize {
    5
}

fn default_batch_decrease_step() -> usize {
    2
}

fn default_batch_failure_step() -> usize {
    5
}

fn default_batch_window() -> usize {
    10
}

fn default_batch_hard_failure_ratio() -> f64 {
    0.5
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_size: default_batch_initial(),
            min_size: default_batch_min(),
            max_size: default_batch_max(),
            increase_threshold: default_batch_increase_threshold(),
            decrease_threshold: default_batch_decrease_threshold(),
            increase_step: default_batch_increase_step(),
            decrease_step: default_batch_decrease_step(),
            failure_step: default_batch_failure_step(),
            window: default_batch_window(),
            hard_failure_ratio: default_batch_hard_failure_ratio(),
        }
    }
}

/// 遥测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// 快照历史容量
    #[serde(default = "default_telemetry_history")]
    pub history_capacity: usize,
}

fn default_telemetry_history() -> usize {
    100
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_telemetry_history(),
        }
    }
}

/// 设备信号覆盖
///
/// 未设置的字段由 CapabilityDetector 探测结果补全
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub is_mobile: Option<bool>,
    #[serde(default)]
    pub is_low_end: Option<bool>,
    #[serde(default)]
    pub connection: Option<ConnectionClass>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub battery_charging: Option<bool>,
}

impl DeviceConfig {
    /// 用覆盖值修正探测得到的信号
    pub fn apply(&self, mut signals: DeviceSignals) -> DeviceSignals {
        if let Some(is_mobile) = self.is_mobile {
            signals.is_mobile = is_mobile;
        }
        if let Some(is_low_end) = self.is_low_end {
            signals.is_low_end = is_low_end;
        }
        if let Some(connection) = self.connection {
            signals.connection = connection;
        }
        if self.battery_level.is_some() {
            signals.battery_level = self.battery_level;
        }
        if let Some(charging) = self.battery_charging {
            signals.battery_charging = charging;
        }
        signals
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate()?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> Result<()> {
        if self.nodes.endpoints.is_empty() {
            anyhow::bail!("nodes.endpoints 不能为空");
        }
        if self.publish.max_concurrent == 0 || self.publish.max_concurrent_nodes == 0 {
            anyhow::bail!("publish.max_concurrent / max_concurrent_nodes 必须大于 0");
        }
        if self.batch.min_size == 0 || self.batch.min_size > self.batch.max_size {
            anyhow::bail!(
                "batch.min_size ({}) 必须在 1..=max_size ({}) 范围内",
                self.batch.min_size,
                self.batch.max_size
            );
        }
        if self.batch.decrease_threshold > self.batch.increase_threshold {
            anyhow::bail!("batch.decrease_threshold 不能大于 increase_threshold");
        }
        if self.cache.compression_level > 9 {
            anyhow::bail!("cache.compression_level 必须在 0-9 之间");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nodes.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.nodes.check_interval(), Duration::from_secs(60));
        assert_eq!(config.telemetry.history_capacity, 100);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [nodes]
            endpoints = ["https://a.example", "https://b.example"]

            [batch]
            max_size = 80
            "#,
        )
            .unwrap();

        assert_eq!(config.nodes.endpoints.len(), 2);
        assert_eq!(config.nodes.probe_path, "/ipfs/bafkqaaa");
        assert_eq!(config.batch.max_size, 80);
        assert_eq!(config.batch.min_size, 5);
        assert_eq!(config.cache.max_items, 1000);
    }

    #[test]
    fn test_invalid_batch_bounds() {
        let mut config = AppConfig::default();
        config.batch.min_size = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_overrides() {
        let overrides = DeviceConfig {
            is_mobile: Some(true),
            connection: Some(ConnectionClass::TwoG),
            ..Default::default()
        };
        let signals = overrides.apply(DeviceSignals::default());
        assert!(signals.is_mobile);
        assert_eq!(signals.connection, ConnectionClass::TwoG);
        assert!(!signals.is_low_end);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.publish.max_concurrent_nodes = 5;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.publish.max_concurrent_nodes, 5);
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.server.port, 18980);
    }
}
