// 设备画像 → 运行参数
//
// 决策表按顺序应用，后面的规则进一步收紧：
// | 条件                    | batch | 并发 | 压缩               |
// | 基线（桌面）            | 25    | 3    | medium             |
// | 移动设备                | 10    | 2    | medium             |
// | 移动 + 低端             | 5     | 1    | medium，关闭后台线程 |
// | 移动 + 慢速网络         | 3     | 1    | high（质量 0.6）    |
// | 电量 < 20% 且未充电     | batch 减半（≥2），并发 1，覆盖以上所有规则 |

use crate::common::retry::RetryPolicy;
use crate::device::capability::Capabilities;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// 低电量阈值
const LOW_BATTERY_THRESHOLD: f64 = 0.2;

/// 低电量时 batch 的下限
const LOW_BATTERY_MIN_BATCH: usize = 2;

/// 网络类型（effective type）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionClass {
    #[serde(rename = "slow-2g")]
    Slow2G,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl ConnectionClass {
    /// slow-2g / 2g 视为慢速网络
    pub fn is_slow(&self) -> bool {
        matches!(self, ConnectionClass::Slow2G | ConnectionClass::TwoG)
    }
}

impl FromStr for ConnectionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "slow-2g" => Ok(ConnectionClass::Slow2G),
            "2g" => Ok(ConnectionClass::TwoG),
            "3g" => Ok(ConnectionClass::ThreeG),
            "4g" => Ok(ConnectionClass::FourG),
            "unknown" | "" => Ok(ConnectionClass::Unknown),
            other => Err(format!("未知的网络类型: {}", other)),
        }
    }
}

/// 压缩等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Low,
    Medium,
    High,
}

/// 设备信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignals {
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub is_low_end: bool,
    #[serde(default)]
    pub connection: ConnectionClass,
    /// 电量 0.0-1.0，未知为 None
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub battery_charging: bool,
}

impl Default for DeviceSignals {
    fn default() -> Self {
        Self {
            is_mobile: false,
            is_low_end: false,
            connection: ConnectionClass::Unknown,
            battery_level: None,
            battery_charging: true,
        }
    }
}

impl DeviceSignals {
    /// 从本机能力推断信号（网络与电量未知）
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        Self {
            is_low_end: capabilities.is_low_end(),
            ..Default::default()
        }
    }

    fn is_low_battery(&self) -> bool {
        !self.battery_charging
            && self
                .battery_level
                .map(|level| level < LOW_BATTERY_THRESHOLD)
                .unwrap_or(false)
    }
}

/// 运行参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub compression_level: CompressionLevel,
    /// 图片质量 0.0-1.0
    pub image_quality: f32,
    pub use_streaming: bool,
    pub use_background_workers: bool,
    pub cache_item_budget: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_concurrent: 3,
            compression_level: CompressionLevel::Medium,
            image_quality: 0.85,
            use_streaming: false,
            use_background_workers: true,
            cache_item_budget: 1000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
            .with_jitter(0.2)
    }
}

/// 设备画像解析器
pub struct DeviceProfileResolver;

impl DeviceProfileResolver {
    pub fn resolve(signals: &DeviceSignals) -> Settings {
        let mut settings = Settings::default();

        if signals.is_mobile {
            settings.batch_size = 10;
            settings.max_concurrent = 2;
            settings.image_quality = 0.75;
            settings.use_streaming = true;
            settings.cache_item_budget = 500;

            if signals.is_low_end {
                settings.batch_size = 5;
                settings.max_concurrent = 1;
                settings.use_background_workers = false;
                settings.cache_item_budget = 200;
            }

            if signals.connection.is_slow() {
                settings.batch_size = 3;
                settings.max_concurrent = 1;
                settings.compression_level = CompressionLevel::High;
                settings.image_quality = 0.6;
                settings.retry_attempts = 5;
                settings.retry_delay_ms = 2000;
            }
        }

        if signals.is_low_battery() {
            settings.batch_size = (settings.batch_size / 2).max(LOW_BATTERY_MIN_BATCH);
            settings.max_concurrent = 1;
        }

        settings
    }
}
