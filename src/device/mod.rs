// 设备能力与运行参数模块

pub mod capability;
pub mod optimizer;
pub mod profile;

pub use capability::{Capabilities, CapabilityDetector, Feature};
pub use optimizer::{OptimizeOptions, SafeOptimizer, StrategyStats};
pub use profile::{ConnectionClass, DeviceProfileResolver, DeviceSignals, Settings};
