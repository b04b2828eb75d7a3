// 本机能力检测
//
// 启动时检测一次，结果供 DeviceProfileResolver 与 SafeOptimizer 使用

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use sysinfo::System;
use tracing::info;

const GIB: u64 = 1024 * 1024 * 1024;

/// 操作系统类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    Windows,
    Linux,
    MacOS,
    Unknown,
}

/// 可选能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// CPU 支持 SIMD（AVX2/SSE4.1/NEON）
    Simd,
    /// 多核，可把哈希、图片编码放到后台线程
    MultiCore,
    /// 内存充足
    HighMemory,
    /// 运行在容器中
    Container,
}

/// 内存档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    /// < 2GiB
    Low,
    /// < 8GiB
    Medium,
    High,
}

impl MemoryClass {
    pub fn from_bytes(total: u64) -> Self {
        if total < 2 * GIB {
            MemoryClass::Low
        } else if total < 8 * GIB {
            MemoryClass::Medium
        } else {
            MemoryClass::High
        }
    }
}

/// CPU 档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreClass {
    /// <= 2 核
    Low,
    /// <= 4 核
    Medium,
    High,
}

impl CoreClass {
    pub fn from_cores(cores: usize) -> Self {
        match cores {
            0..=2 => CoreClass::Low,
            3..=4 => CoreClass::Medium,
            _ => CoreClass::High,
        }
    }
}

/// 静态特征
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub os_type: OsType,
    pub cpu_cores: usize,
    pub core_class: CoreClass,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub memory_class: MemoryClass,
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            os_type: OsType::Unknown,
            cpu_cores: 1,
            core_class: CoreClass::Low,
            total_memory_bytes: 0,
            available_memory_bytes: 0,
            memory_class: MemoryClass::Low,
        }
    }
}

/// 检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub features: BTreeSet<Feature>,
    pub flags: CapabilityFlags,
}

impl Capabilities {
    pub fn with_features(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            features: features.into_iter().collect(),
            flags: CapabilityFlags::default(),
        }
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// 内存或 CPU 处于最低档
    pub fn is_low_end(&self) -> bool {
        self.flags.memory_class == MemoryClass::Low || self.flags.core_class == CoreClass::Low
    }
}

/// 能力检测器
pub struct CapabilityDetector;

impl CapabilityDetector {
    /// 检测本机能力
    pub fn detect() -> Capabilities {
        let mut system = System::new();
        system.refresh_memory();
        let total_memory_bytes = system.total_memory();
        let available_memory_bytes = system.available_memory();

        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let flags = CapabilityFlags {
            os_type: Self::os_type(),
            cpu_cores,
            core_class: CoreClass::from_cores(cpu_cores),
            total_memory_bytes,
            available_memory_bytes,
            memory_class: MemoryClass::from_bytes(total_memory_bytes),
        };

        let mut features = BTreeSet::new();
        if Self::has_simd() {
            features.insert(Feature::Simd);
        }
        if cpu_cores > 1 {
            features.insert(Feature::MultiCore);
        }
        if flags.memory_class == MemoryClass::High {
            features.insert(Feature::HighMemory);
        }
        if Self::is_container() {
            features.insert(Feature::Container);
        }

        info!(
            "能力检测完成: cores={}, memory={}MB, features={:?}",
            cpu_cores,
            total_memory_bytes / 1024 / 1024,
            features
        );

        Capabilities { features, flags }
    }

    fn os_type() -> OsType {
        #[cfg(target_os = "windows")]
        return OsType::Windows;

        #[cfg(target_os = "macos")]
        return OsType::MacOS;

        #[cfg(target_os = "linux")]
        return OsType::Linux;

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        return OsType::Unknown;
    }

    fn has_simd() -> bool {
        #[cfg(target_arch = "x86_64")]
        return std::arch::is_x86_feature_detected!("avx2")
            || std::arch::is_x86_feature_detected!("sse4.1");

        #[cfg(target_arch = "aarch64")]
        return std::arch::is_aarch64_feature_detected!("neon");

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        return false;
    }

    /// 检测是否运行在容器中
    ///
    /// 1. 检查 /.dockerenv 文件
    /// 2. 检查 /proc/1/cgroup 内容
    /// 3. 检查环境变量 container
    fn is_container() -> bool {
        if Path::new("/.dockerenv").exists() {
            return true;
        }

        if let Ok(content) = fs::read_to_string("/proc/1/cgroup") {
            if content.contains("docker") || content.contains("containerd") {
                return true;
            }
        }

        std::env::var("container").is_ok()
    }
}
