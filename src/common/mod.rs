//! 公共模块
//!
//! 提供跨模块使用的通用组件

pub mod limiter;
pub mod retry;
pub mod telemetry;

pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use retry::RetryPolicy;
pub use telemetry::{TelemetryAggregator, TelemetrySnapshot};
