//! 宿主环境接口
//!
//! 宿主环境（即插即用发现机制 + 控制请求传输）通过 [`HostEvents`] 的三个方法
//! 驱动核心层；实例属性查询通过 [`DeviceProperties`] 提供。

use crate::error::SidebandError;
use crate::instance::InstanceHandle;
use sideband_protocol::{SidebandRequest, SidebandResponse};

/// 实例属性查询
pub trait DeviceProperties {
    /// 查询实例的序列号（UI Number）
    ///
    /// 失败时返回 `IdentificationFailed`，实例仍会挂载，只是序列号未设置。
    fn serial_number(&self, handle: InstanceHandle) -> Result<u32, SidebandError>;
}

/// 固定序列号属性源
///
/// `FixedSerial(None)` 模拟总线驱动未报告序列号的设备。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSerial(pub Option<u32>);

impl DeviceProperties for FixedSerial {
    fn serial_number(&self, handle: InstanceHandle) -> Result<u32, SidebandError> {
        self.0.ok_or_else(|| SidebandError::IdentificationFailed {
            handle,
            reason: "serial number property not reported".to_string(),
        })
    }
}

/// 宿主环境投递的事件
///
/// 同一句柄的生命周期事件由宿主串行投递，且 `on_instance_disappears`
/// 总与之前的 `on_instance_appears` 成对；不同句柄的事件和查询可以并发。
pub trait HostEvents: Send + Sync {
    /// 新实例出现
    ///
    /// 只有注册表拒绝（`ResourceExhausted` / `DuplicateInstance`）时返回错误；
    /// 识别失败和通道创建失败都只记录日志。
    fn on_instance_appears(
        &self,
        handle: InstanceHandle,
        properties: &dyn DeviceProperties,
    ) -> Result<(), SidebandError>;

    /// 实例离开；未知实例返回非致命的 `NotFound`
    fn on_instance_disappears(&self, handle: InstanceHandle) -> Result<(), SidebandError>;

    /// 共享通道上到达的查询
    fn on_query(&self, request: SidebandRequest) -> Result<SidebandResponse, SidebandError>;
}
