//! 过滤器上下文
//!
//! 持有排他锁、注册表、实例记录和共享通道状态的唯一所有者。进程启动时构造，
//! 退出时显式 `shutdown()`；三个组件都通过引用借用它，不使用全局变量。

use crate::channel::{ChannelManager, SharedChannel};
use crate::config::SidebandConfig;
use crate::error::{SidebandError, TransportError};
use crate::host::{DeviceProperties, HostEvents};
use crate::instance::{InstanceArena, InstanceHandle, InstanceState};
use crate::lifecycle::InstanceLifecycle;
use crate::metrics::{MetricsSnapshot, SidebandMetrics};
use crate::registry::InstanceRegistry;
use crate::transport::{ChannelTransport, submit};
use parking_lot::Mutex;
use sideband_protocol::{InstanceSummary, SidebandRequest, SidebandResponse};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// 受排他锁保护的全部可变状态
#[derive(Debug)]
pub(crate) struct FleetState {
    pub(crate) registry: InstanceRegistry,
    pub(crate) records: InstanceArena,
    pub(crate) channel: Option<SharedChannel>,
}

/// 上下文共享部分（分发线程通过 `Weak` 引用）
pub(crate) struct FleetShared {
    pub(crate) this: Weak<FleetShared>,
    /// 排他锁
    pub(crate) state: Mutex<FleetState>,
    pub(crate) transport: Arc<dyn ChannelTransport>,
    pub(crate) config: SidebandConfig,
    pub(crate) metrics: SidebandMetrics,
}

/// 过滤器上下文
///
/// # 线程安全
///
/// `SidebandContext` 是 `Send + Sync`，宿主环境可以从任意线程并发投递事件，
/// 通常包在 `Arc` 中共享。
///
/// # 示例
///
/// ```rust
/// use sideband_core::{FixedSerial, HostEvents, InstanceHandle, SidebandConfig, SidebandContext};
/// use sideband_core::transport::MemoryTransport;
/// use std::sync::Arc;
///
/// let transport = MemoryTransport::new();
/// let ctx = SidebandContext::new(SidebandConfig::default(), Arc::new(transport.clone())).unwrap();
///
/// ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10))).unwrap();
/// assert!(ctx.channel_exists());
///
/// let response = transport.connect("ToasterFilter").enumerate().unwrap();
/// assert_eq!(response.serial_numbers(), vec![Some(10)]);
///
/// ctx.shutdown().unwrap();
/// ```
pub struct SidebandContext {
    shared: Arc<FleetShared>,
}

impl SidebandContext {
    /// 创建上下文（注册表为空，通道不存在）
    pub fn new(
        config: SidebandConfig,
        transport: Arc<dyn ChannelTransport>,
    ) -> Result<Self, SidebandError> {
        config.validate()?;
        let registry = InstanceRegistry::with_limit(config.registry.max_instances);
        let shared = Arc::new_cyclic(|this| FleetShared {
            this: this.clone(),
            state: Mutex::new(FleetState {
                registry,
                records: InstanceArena::default(),
                channel: None,
            }),
            transport,
            config,
            metrics: SidebandMetrics::new(),
        });
        Ok(Self { shared })
    }

    pub fn channel_manager(&self) -> ChannelManager<'_> {
        ChannelManager::new(&self.shared)
    }

    pub fn lifecycle(&self) -> InstanceLifecycle<'_> {
        InstanceLifecycle::new(&self.shared)
    }

    pub fn config(&self) -> &SidebandConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn instance_count(&self) -> usize {
        self.shared.state.lock().registry.count()
    }

    pub fn channel_exists(&self) -> bool {
        self.shared.state.lock().channel.is_some()
    }

    /// 当前通道地址（不存在时为 `None`）
    pub fn channel_address(&self) -> Option<String> {
        let state = self.shared.state.lock();
        state.channel.as_ref().map(|c| c.address().to_string())
    }

    pub fn instance_state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        self.shared
            .state
            .lock()
            .records
            .get(handle)
            .map(|r| r.state())
    }

    /// 按注册顺序返回所有实例的摘要（一致快照）
    pub fn snapshot(&self) -> Vec<InstanceSummary> {
        let state = self.shared.state.lock();
        state
            .registry
            .iter()
            .filter_map(|handle| state.records.get(handle).map(|r| r.summary()))
            .collect()
    }

    /// 按注册顺序拆除所有剩余实例，最后一个实例拆除时销毁通道
    pub fn shutdown(self) -> Result<(), SidebandError> {
        let handles: Vec<InstanceHandle> = self.shared.state.lock().registry.iter().collect();
        if !handles.is_empty() {
            info!("Shutting down with {} attached instances", handles.len());
        }

        let lifecycle = self.lifecycle();
        for handle in handles {
            if let Err(e) = lifecycle.on_instance_disappears(handle) {
                warn!("Failed to detach {} during shutdown: {}", handle, e);
            }
        }

        let state = self.shared.state.lock();
        let remaining = state.registry.count().max(state.records.len());
        if remaining > 0 || state.channel.is_some() {
            return Err(SidebandError::ShutdownIncomplete { remaining });
        }
        Ok(())
    }
}

impl HostEvents for SidebandContext {
    fn on_instance_appears(
        &self,
        handle: InstanceHandle,
        properties: &dyn DeviceProperties,
    ) -> Result<(), SidebandError> {
        self.lifecycle().on_instance_appears(handle, properties)
    }

    fn on_instance_disappears(&self, handle: InstanceHandle) -> Result<(), SidebandError> {
        self.lifecycle().on_instance_disappears(handle)
    }

    /// 经由共享通道的串行队列分发，通道不存在时报告不可达
    fn on_query(&self, request: SidebandRequest) -> Result<SidebandResponse, SidebandError> {
        let queue = {
            let state = self.shared.state.lock();
            state.channel.as_ref().and_then(|c| c.request_sender())
        };
        let queue = queue.ok_or_else(|| {
            TransportError::Unreachable(self.shared.config.channel.alias.clone())
        })?;
        Ok(submit(&queue, request)?)
    }
}

impl Drop for SidebandContext {
    fn drop(&mut self) {
        let channel = self.shared.state.lock().channel.take();
        if let Some(channel) = channel {
            warn!("Context dropped while shared channel still exists, releasing it");
            channel.retire().finish();
        }
    }
}
