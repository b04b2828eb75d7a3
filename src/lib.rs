// Content Publish Rust Library
// 内容寻址资产的冗余发布核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误类型
pub mod error;

// 公共模块（并发限制、重试策略、遥测）
pub mod common;

// 内容缓存
pub mod cache;

// 设备能力与画像
pub mod device;

// 存储节点客户端
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 诊断服务模块
pub mod server;

// 导出常用类型
pub use cache::ContentCache;
pub use common::{ConcurrencyLimiter, RetryPolicy, TelemetryAggregator};
pub use config::AppConfig;
pub use error::{NodeFailure, PublishError};
pub use server::AppState;
pub use uploader::{
    Asset, NodeHealthRegistry, OrchestrationReport, PublishResult, RedundantPublisher,
    UploadOrchestrator, UploadTask, UploadTaskStatus,
};
