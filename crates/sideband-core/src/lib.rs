//! 旁路通道核心层
//!
//! 本模块跟踪过滤器挂载的全部设备实例，并维护一个进程级的共享控制通道：
//! - 实例注册表（按挂载顺序，排他锁保护）
//! - 共享通道生命周期（第一个实例出现时创建，最后一个实例离开前销毁）
//! - 查询分发（枚举在线实例的序列号）
//!
//! # 使用场景
//!
//! 宿主环境（即插即用发现机制 + 控制请求传输）通过 [`HostEvents`] 投递事件，
//! 外部调用者通过别名打开共享通道发送 [`SidebandRequest`]。
//! 传输层由 [`transport::ChannelTransport`] 抽象，内置进程内实现和
//! Unix Domain Socket 实现。

mod channel;
mod config;
mod context;
mod error;
mod host;
mod instance;
mod lifecycle;
pub mod metrics;
mod registry;
pub mod transport;

pub use channel::{ChannelInit, ChannelManager, CreationStep, SharedChannel};
pub use config::{ChannelConfig, RegistryConfig, SidebandConfig};
pub use context::SidebandContext;
pub use error::{SidebandError, TransportError};
pub use host::{DeviceProperties, FixedSerial, HostEvents};
pub use instance::{InstanceHandle, InstanceRecord, InstanceState};
pub use lifecycle::InstanceLifecycle;
pub use metrics::{MetricsSnapshot, SidebandMetrics};
pub use registry::InstanceRegistry;

pub use sideband_protocol::{
    CompletionStatus, InstanceSummary, SidebandRequest, SidebandResponse,
};
