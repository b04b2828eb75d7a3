//! 重试策略
//!
//! 所有网络调用点共用同一个策略对象：最大尝试次数、初始延迟、倍数、
//! 延迟上限、抖动，以及限流时的最短等待时间

use crate::storage::types::NodeErrorKind;
use rand::Rng;
use std::time::Duration;

/// 默认最大尝试次数（含首次）
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的最短等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
    rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            multiplier: 2.0,
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            jitter: 0.0,
            rate_limit_floor: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// 不重试，只尝试一次
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_rate_limit_floor(mut self, floor: Duration) -> Self {
        self.rate_limit_floor = floor;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 attempt 次（从 1 开始）失败后是否还应重试
    pub fn should_retry(&self, attempt: u32, kind: NodeErrorKind) -> bool {
        kind.is_retriable() && attempt < self.max_attempts
    }

    /// 计算第 attempt 次失败后的等待时间
    ///
    /// # 延迟序列（base=100ms, multiplier=2）
    /// - attempt=1: 100ms
    /// - attempt=2: 200ms
    /// - attempt=3: 400ms
    /// - 最大: max_delay
    pub fn delay_for(&self, attempt: u32, kind: NodeErrorKind) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let raw_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let jittered_ms = if self.jitter > 0.0 && capped_ms > 0.0 {
            let spread = capped_ms * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped_ms + offset).max(0.0)
        } else {
            capped_ms
        };

        let delay = Duration::from_millis(jittered_ms.round() as u64);

        // 限流时使用更长的等待时间
        if kind == NodeErrorKind::RateLimited {
            delay.max(self.rate_limit_floor)
        } else {
            delay
        }
    }
}
