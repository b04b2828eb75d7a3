// 上传编排器
//
// 负责把一组资产发布出去：
// - 每个资产一个任务，状态单调推进
// - 图片资产可选先经过安全优化器
// - 按自适应批次控制器给出的大小分波上传
// - 每波结束向控制器提交一次统计，并采样缓存内存
//
// 单个资产失败不会中断同批的其他资产，失败的资产由调用方显式重试

use crate::cache::ContentCache;
use crate::common::telemetry::TelemetryAggregator;
use crate::device::optimizer::{OptimizeOptions, SafeOptimizer};
use crate::device::profile::Settings;
use crate::error::{NodeFailure, PublishError};
use crate::uploader::batch::{AdaptiveBatchController, BatchDescriptor, BatchSummary};
use crate::uploader::engine::{PublishResult, RedundantPublisher};
use crate::uploader::task::{Asset, AssetSource, UploadTask};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会经过优化器的扩展名
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];

/// 失败的资产
#[derive(Debug, Clone, Serialize)]
pub struct FailedAsset {
    /// 在输入中的下标
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<NodeFailure>,
}

/// 成功的资产
#[derive(Debug, Clone, Serialize)]
pub struct SucceededAsset {
    pub index: usize,
    pub name: String,
    pub result: PublishResult,
}

/// 一次编排的汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationReport {
    pub succeeded: Vec<SucceededAsset>,
    pub failed: Vec<FailedAsset>,
    /// 与输入按下标对齐
    pub tasks: Vec<UploadTask>,
    pub batches: Vec<BatchSummary>,
}

impl OrchestrationReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 上传编排器
pub struct UploadOrchestrator {
    publisher: Arc<RedundantPublisher>,
    controller: Arc<AdaptiveBatchController>,
    cache: Arc<ContentCache>,
    telemetry: Arc<TelemetryAggregator>,
    optimizer: Option<Arc<SafeOptimizer>>,
    settings: Settings,
}

impl UploadOrchestrator {
    pub fn new(
        publisher: Arc<RedundantPublisher>,
        controller: Arc<AdaptiveBatchController>,
        cache: Arc<ContentCache>,
        telemetry: Arc<TelemetryAggregator>,
        settings: Settings,
    ) -> Self {
        Self {
            publisher,
            controller,
            cache,
            telemetry,
            optimizer: None,
            settings,
        }
    }

    /// 启用图片优化
    pub fn with_optimizer(mut self, optimizer: Arc<SafeOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn controller(&self) -> &AdaptiveBatchController {
        &self.controller
    }

    /// 对内存中的图片资产运行优化器
    ///
    /// 所有策略都失败时保留原始负载
    async fn prepare(&self, asset: &Asset, task: &mut UploadTask) -> Asset {
        let optimizer = match &self.optimizer {
            Some(optimizer) if is_image_name(&asset.name) => optimizer.clone(),
            _ => return asset.clone(),
        };
        let bytes = match &asset.source {
            AssetSource::Bytes(bytes) => bytes.clone(),
            AssetSource::File(_) => return asset.clone(),
        };

        let options = OptimizeOptions::from_settings(&self.settings);
        let outcome = if self.settings.use_background_workers {
            let input = bytes.clone();
            match tokio::task::spawn_blocking(move || optimizer.optimize(&input, &options)).await
            {
                Ok(outcome) => outcome,
                Err(e) => Err(PublishError::Optimize(format!("优化任务异常退出: {}", e))),
            }
        } else {
            optimizer.optimize(&bytes, &options)
        };

        match outcome {
            Ok(optimized) => {
                debug!(
                    "资产已优化: name={}, strategy={}, {} -> {} 字节",
                    asset.name,
                    optimized.strategy,
                    bytes.len(),
                    optimized.bytes.len()
                );
                task.optimized_by = Some(optimized.strategy.to_string());
                task.size = optimized.bytes.len() as u64;
                Asset::from_bytes(asset.name.clone(), optimized.bytes, asset.metadata.clone())
            }
            Err(e) => {
                warn!("资产优化失败，使用原始负载: name={}, 原因={}", asset.name, e);
                asset.clone()
            }
        }
    }

    /// 发布一组资产
    pub async fn run(&self, assets: &[Asset], cancel: &CancellationToken) -> OrchestrationReport {
        let mut report = OrchestrationReport::default();

        for asset in assets {
            let size = match asset.size().await {
                Ok(size) => size,
                Err(e) => {
                    warn!("读取资产大小失败: name={}, 原因={}", asset.name, e);
                    0
                }
            };
            report
                .tasks
                .push(UploadTask::new(asset.name.clone(), size, asset.metadata.clone()));
        }

        info!(
            "开始编排上传: 资产数={}, 初始批次={}",
            assets.len(),
            self.controller.current_size()
        );

        let mut offset = 0;
        while offset < assets.len() {
            if cancel.is_cancelled() {
                for (index, task) in report.tasks.iter_mut().enumerate().skip(offset) {
                    task.mark_failed(PublishError::Cancelled.kind(), PublishError::Cancelled.to_string());
                    report.failed.push(FailedAsset {
                        index,
                        name: task.name.clone(),
                        kind: PublishError::Cancelled.kind().to_string(),
                        error: PublishError::Cancelled.to_string(),
                        failed_nodes: Vec::new(),
                    });
                }
                warn!("编排被取消，剩余 {} 个资产未上传", assets.len() - offset);
                break;
            }

            let end = (offset + self.controller.current_size().max(1)).min(assets.len());
            let mut wave = Vec::with_capacity(end - offset);
            for index in offset..end {
                let prepared = self.prepare(&assets[index], &mut report.tasks[index]).await;
                report.tasks[index].mark_in_flight();
                wave.push(prepared);
            }

            let mut batch = BatchDescriptor::start(wave.len());
            let results = self.publisher.upload_batch(&wave, cancel).await;

            for (i, result) in results.into_iter().enumerate() {
                let index = offset + i;
                let task = &mut report.tasks[index];
                match result {
                    Ok(result) => {
                        task.content_hash = Some(result.content_hash.clone());
                        task.candidate_nodes =
                            result.all_results.iter().map(|a| a.node.clone()).collect();
                        task.attempts = result.all_results.iter().map(|a| a.attempts).sum();
                        task.mark_succeeded(
                            Some(result.node.clone()),
                            result.hash.clone(),
                            result.url.clone(),
                            result.from_cache,
                        );
                        batch.record_success();
                        report.succeeded.push(SucceededAsset {
                            index,
                            name: task.name.clone(),
                            result,
                        });
                    }
                    Err(e) => {
                        task.mark_failed(e.kind(), e.to_string());
                        batch.record_failure();
                        report.failed.push(FailedAsset {
                            index,
                            name: task.name.clone(),
                            kind: e.kind().to_string(),
                            error: e.to_string(),
                            failed_nodes: e.failed_nodes().to_vec(),
                        });
                    }
                }
            }

            let summary = self.controller.complete_batch(batch);
            info!(
                "批次完成: 大小={}, 成功={}, 失败={}, 吞吐={:.2} 文件/秒, 下一批={}",
                summary.size,
                summary.success_count,
                summary.failure_count,
                summary.throughput,
                summary.next_size
            );
            report.batches.push(summary);
            self.telemetry.record_memory_usage(self.cache.memory_usage());

            offset = end;
        }

        info!(
            "编排完成: 成功={}, 失败={}, 批次数={}",
            report.success_count(),
            report.failure_count(),
            report.batches.len()
        );
        report
    }

    /// 重新发布上一次失败的资产
    ///
    /// `assets` 为上一次 run 的输入，新报告中的下标指向 `assets`
    pub async fn retry_failed(
        &self,
        assets: &[Asset],
        previous: &OrchestrationReport,
        cancel: &CancellationToken,
    ) -> OrchestrationReport {
        let indices: Vec<usize> = previous
            .failed
            .iter()
            .map(|f| f.index)
            .filter(|&index| index < assets.len())
            .collect();
        let retry_assets: Vec<Asset> = indices.iter().map(|&index| assets[index].clone()).collect();

        info!("重试失败的资产: {} 个", retry_assets.len());
        let mut report = self.run(&retry_assets, cancel).await;

        for succeeded in &mut report.succeeded {
            succeeded.index = indices[succeeded.index];
        }
        for failed in &mut report.failed {
            failed.index = indices[failed.index];
        }
        report
    }
}
