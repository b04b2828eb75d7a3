// 自适应批次控制
//
// 闭环：批次大小 → 实测吞吐 → 下一批大小
// - 滚动窗口平均吞吐高于扩大阈值：按 increase_step 扩大，不超过 max
// - 低于缩小阈值：按较小的 decrease_step 缩小，不低于 min
// - 批次硬失败：不看吞吐，立即按 failure_step 缩小

use crate::config::BatchConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, info};

/// 吞吐计算时的最短耗时（秒），避免除以零
const MIN_ELAPSED_SECS: f64 = 0.001;

/// 一波处理的统计，只向控制器提交一次
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    pub size: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub started_at: Instant,
}

impl BatchDescriptor {
    pub fn start(size: usize) -> Self {
        Self {
            size,
            success_count: 0,
            failure_count: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn failure_ratio(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    /// 成功文件数 / 秒
    pub fn throughput(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(MIN_ELAPSED_SECS);
        self.success_count as f64 / elapsed
    }
}

/// 批次汇总（写入报告）
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub size: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub throughput: f64,
    pub hard_failure: bool,
    pub next_size: usize,
}

#[derive(Debug)]
struct ControllerState {
    current: usize,
    window: VecDeque<f64>,
}

/// 自适应批次控制器
#[derive(Debug)]
pub struct AdaptiveBatchController {
    config: BatchConfig,
    state: Mutex<ControllerState>,
}

impl AdaptiveBatchController {
    pub fn new(config: BatchConfig) -> Self {
        let min = config.min_size.max(1);
        let max = config.max_size.max(min);
        let current = config.initial_size.clamp(min, max);
        Self {
            config: BatchConfig {
                min_size: min,
                max_size: max,
                window: config.window.max(1),
                ..config
            },
            state: Mutex::new(ControllerState {
                current,
                window: VecDeque::new(),
            }),
        }
    }

    /// 以设备画像给出的 batch 作为初始值
    pub fn with_initial(config: BatchConfig, initial: usize) -> Self {
        Self::new(BatchConfig {
            initial_size: initial,
            ..config
        })
    }

    pub fn current_size(&self) -> usize {
        self.state.lock().current
    }

    pub fn rolling_average(&self) -> f64 {
        let state = self.state.lock();
        average(&state.window)
    }

    /// 提交一个吞吐样本（文件/秒），返回下一批大小
    pub fn next_batch_size(&self, last_throughput: f64) -> usize {
        let mut state = self.state.lock();
        if state.window.len() >= self.config.window {
            state.window.pop_front();
        }
        state.window.push_back(last_throughput.max(0.0));

        let avg = average(&state.window);
        let before = state.current;

        if avg > self.config.increase_threshold {
            state.current = (state.current + self.config.increase_step).min(self.config.max_size);
        } else if avg < self.config.decrease_threshold {
            state.current = state
                .current
                .saturating_sub(self.config.decrease_step)
                .max(self.config.min_size);
        }

        if state.current != before {
            debug!(
                "批次大小调整: {} -> {} (滚动平均吞吐 {:.2} 文件/秒)",
                before, state.current, avg
            );
        }
        state.current
    }

    /// 批次硬失败：立即缩小，并丢弃旧样本
    pub fn record_hard_failure(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.current;
        state.current = state
            .current
            .saturating_sub(self.config.failure_step)
            .max(self.config.min_size);
        state.window.clear();
        info!("批次硬失败，批次大小 {} -> {}", before, state.current);
        state.current
    }

    /// 消费一个批次统计
    pub fn complete_batch(&self, batch: BatchDescriptor) -> BatchSummary {
        let throughput = batch.throughput();
        let attempted = batch.success_count + batch.failure_count;
        let hard_failure =
            attempted > 0 && batch.failure_ratio() >= self.config.hard_failure_ratio;

        let next_size = if hard_failure {
            self.record_hard_failure()
        } else {
            self.next_batch_size(throughput)
        };

        BatchSummary {
            size: batch.size,
            success_count: batch.success_count,
            failure_count: batch.failure_count,
            throughput,
            hard_failure,
            next_size,
        }
    }
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}
