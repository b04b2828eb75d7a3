//! 遥测聚合器
//!
//! 累计上传、缓存、网络、内存计数器，快照时才计算派生指标（命中率、
//! 平均吞吐、错误率），快照写入有界历史环

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// 默认历史容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// 最近错误保留条数
const RECENT_ERRORS_CAPACITY: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryCounters {
    pub used: u64,
    pub peak: u64,
}

/// 遥测快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub uploads: UploadCounters,
    pub cache: CacheCounters,
    pub network: NetworkCounters,
    pub memory: MemoryCounters,
    /// 成功上传的平均吞吐（字节/秒）
    pub throughput_bytes_per_sec: f64,
    pub uptime_secs: u64,
}

/// 失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub bytes: u64,
    pub error: String,
}

#[derive(Debug, Default)]
struct Counters {
    uploads_total: u64,
    uploads_success: u64,
    uploads_failed: u64,
    bytes_uploaded: u64,
    upload_duration_ms: u64,
    cache_hits: u64,
    cache_misses: u64,
    network_requests: u64,
    network_errors: u64,
    network_latency_ms: f64,
    memory_used: u64,
    memory_peak: u64,
    recent_errors: VecDeque<ErrorRecord>,
}

/// 遥测聚合器
#[derive(Debug)]
pub struct TelemetryAggregator {
    counters: Mutex<Counters>,
    history: Mutex<VecDeque<TelemetrySnapshot>>,
    capacity: usize,
    started_at: Mutex<Instant>,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TelemetryAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            started_at: Mutex::new(Instant::now()),
        }
    }

    pub fn record_successful_upload(&self, bytes: u64, duration_ms: u64) {
        let mut c = self.counters.lock();
        c.uploads_total += 1;
        c.uploads_success += 1;
        c.bytes_uploaded += bytes;
        c.upload_duration_ms += duration_ms;
    }

    pub fn record_failed_upload(&self, bytes: u64, error: &str) {
        let mut c = self.counters.lock();
        c.uploads_total += 1;
        c.uploads_failed += 1;
        if c.recent_errors.len() >= RECENT_ERRORS_CAPACITY {
            c.recent_errors.pop_front();
        }
        c.recent_errors.push_back(ErrorRecord {
            timestamp: Utc::now(),
            bytes,
            error: error.to_string(),
        });
    }

    pub fn record_cache_hit(&self) {
        self.counters.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.counters.lock().cache_misses += 1;
    }

    /// 记录一次节点请求（探测或上传）
    pub fn record_network_request(&self, latency_ms: f64, ok: bool) {
        let mut c = self.counters.lock();
        c.network_requests += 1;
        c.network_latency_ms += latency_ms.max(0.0);
        if !ok {
            c.network_errors += 1;
        }
    }

    pub fn record_memory_usage(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.memory_used = bytes;
        c.memory_peak = c.memory_peak.max(bytes);
    }

    /// 生成快照并写入历史
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let snapshot = self.current();

        let mut history = self.history.lock();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(snapshot.clone());

        snapshot
    }

    /// 计算当前指标（不写入历史）
    pub fn current(&self) -> TelemetrySnapshot {
        let uptime_secs = self.started_at.lock().elapsed().as_secs();
        let c = self.counters.lock();

        let lookups = c.cache_hits + c.cache_misses;
        let hit_rate = ratio(c.cache_hits as f64, lookups as f64);
        let avg_latency_ms = ratio(c.network_latency_ms, c.network_requests as f64);
        let error_rate = ratio(c.network_errors as f64, c.network_requests as f64);
        let throughput_bytes_per_sec = ratio(
            c.bytes_uploaded as f64,
            c.upload_duration_ms as f64 / 1000.0,
        );

        TelemetrySnapshot {
            timestamp: Utc::now(),
            uploads: UploadCounters {
                total: c.uploads_total,
                success: c.uploads_success,
                failed: c.uploads_failed,
                bytes: c.bytes_uploaded,
            },
            cache: CacheCounters {
                hits: c.cache_hits,
                misses: c.cache_misses,
                hit_rate,
            },
            network: NetworkCounters {
                requests: c.network_requests,
                errors: c.network_errors,
                avg_latency_ms,
                error_rate,
            },
            memory: MemoryCounters {
                used: c.memory_used,
                peak: c.memory_peak,
            },
            throughput_bytes_per_sec,
            uptime_secs,
        }
    }

    pub fn history(&self) -> Vec<TelemetrySnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.counters.lock().recent_errors.iter().cloned().collect()
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
        self.history.lock().clear();
        *self.started_at.lock() = Instant::now();
    }

    /// 导出给诊断界面的 JSON
    pub fn export_metrics(&self) -> serde_json::Value {
        serde_json::json!({
            "current": self.current(),
            "history": self.history(),
            "recent_errors": self.recent_errors(),
        })
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
