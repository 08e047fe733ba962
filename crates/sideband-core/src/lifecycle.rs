//! 实例生命周期控制
//!
//! - 出现：识别 → 创建记录 → 注册（持锁）→ 确保共享通道存在
//! - 离开：在同一次持锁期间先检查/销毁共享通道，再注销；锁外等待分发线程退出
//!
//! 识别失败和通道创建失败都降级为日志：过滤器的首要职责（透传）不依赖
//! 共享通道是否存在。只有注册表拒绝才会让挂载失败。

use crate::channel::ChannelManager;
use crate::context::FleetShared;
use crate::error::SidebandError;
use crate::host::DeviceProperties;
use crate::instance::{InstanceHandle, InstanceRecord, InstanceState};
use crate::metrics::SidebandMetrics;
use tracing::{debug, warn};

/// 实例生命周期控制器
pub struct InstanceLifecycle<'a> {
    shared: &'a FleetShared,
}

impl<'a> InstanceLifecycle<'a> {
    pub(crate) fn new(shared: &'a FleetShared) -> Self {
        Self { shared }
    }

    /// 处理实例出现事件
    ///
    /// # 错误
    /// - `ResourceExhausted`: 注册表无法容纳该实例
    /// - `DuplicateInstance`: 句柄已挂载
    pub fn on_instance_appears(
        &self,
        handle: InstanceHandle,
        properties: &dyn DeviceProperties,
    ) -> Result<(), SidebandError> {
        debug!("Instance appears: {}", handle);

        let serial_no = match properties.serial_number(handle) {
            Ok(serial_no) => Some(serial_no),
            Err(e) => {
                SidebandMetrics::bump(&self.shared.metrics.identification_failures);
                warn!("Failed to get the serial number of {}: {}", handle, e);
                None
            },
        };
        let mut record = InstanceRecord::new(handle, serial_no);

        {
            let mut state = self.shared.state.lock();
            if let Err(e) = state.registry.register(handle) {
                SidebandMetrics::bump(&self.shared.metrics.attach_failures);
                warn!("Failed to register {}: {}", handle, e);
                return Err(e);
            }
            record.advance(InstanceState::Registered);
            state.records.insert(record);
        }

        let channel = ChannelManager::new(self.shared);
        let mut state = self.shared.state.lock();
        let ensured = match channel.ensure_created_locked(&mut state) {
            Ok(_) => true,
            Err(e) => {
                // 不因共享通道创建失败而让挂载失败
                warn!("Shared channel creation failed for {}: {}", handle, e);
                false
            },
        };
        if let Some(record) = state.records.get_mut(handle) {
            if ensured {
                record.advance(InstanceState::ChannelEnsured);
            }
            record.advance(InstanceState::Active);
        }
        Ok(())
    }

    /// 处理实例离开事件
    ///
    /// 未知实例返回 `NotFound`（非致命，已记录日志）。
    pub fn on_instance_disappears(&self, handle: InstanceHandle) -> Result<(), SidebandError> {
        debug!("Instance disappears: {}", handle);

        let channel = ChannelManager::new(self.shared);
        let (retired, result) = {
            let mut state = self.shared.state.lock();
            if let Some(record) = state.records.get_mut(handle) {
                record.advance(InstanceState::TeardownPending);
            }

            // 必须先于注销，且与计数检查处于同一临界区
            let retired = channel.ensure_destroyed_locked(&mut state, handle);

            let result = state.registry.deregister(handle);
            match &result {
                Ok(()) => {
                    if let Some(mut record) = state.records.remove(handle) {
                        record.advance(InstanceState::Deregistered);
                    }
                },
                Err(e) => {
                    SidebandMetrics::bump(&self.shared.metrics.deregister_not_found);
                    warn!("Failed to deregister {}: {}", handle, e);
                },
            }
            (retired, result)
        };

        if let Some(retired) = retired {
            retired.finish();
        }
        result
    }
}
