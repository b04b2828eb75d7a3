// 上传模块
//
// - 内容哈希去重（相同字节只上传一次）
// - 健康节点按延迟排序，多节点冗余并发上传
// - 指数退避重试（带抖动）
// - 自适应批次大小
// - 大文件按块流式读取

pub mod batch;
pub mod chunk;
pub mod engine;
pub mod hasher;
pub mod health;
pub mod manager;
pub mod task;

pub use batch::{AdaptiveBatchController, BatchDescriptor, BatchSummary};
pub use chunk::{StreamChunker, StreamReadError};
pub use engine::{NodeAttempt, PublishResult, PublisherOptions, RedundantPublisher};
pub use hasher::ContentHasher;
pub use health::{NodeHealthRegistry, NodeRecord};
pub use manager::{FailedAsset, OrchestrationReport, SucceededAsset, UploadOrchestrator};
pub use task::{Asset, AssetSource, UploadTask, UploadTaskStatus};
