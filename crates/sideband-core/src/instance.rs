//! 设备实例记录
//!
//! 每个挂载的设备实例对应一条 [`InstanceRecord`]，由生命周期控制器独占所有权，
//! 存放在 [`InstanceArena`] 中；注册表只保存 [`InstanceHandle`] 作为查找键。

use serde::{Deserialize, Serialize};
use sideband_protocol::InstanceSummary;
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// 宿主环境分配的实例句柄（不透明标识）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// 单个实例的生命周期状态
///
/// ```text
/// Discovered → Registered → [ChannelEnsured] → Active → TeardownPending → Deregistered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// 已识别（序列号可能未设置），尚未注册
    Discovered,
    /// 已加入注册表
    Registered,
    /// 共享通道已确认存在
    ChannelEnsured,
    /// 正常工作（即使共享通道不存在）
    Active,
    /// 收到移除事件，正在拆除
    TeardownPending,
    /// 已从注册表移除
    Deregistered,
}

impl InstanceState {
    /// 检查状态转换是否合法
    pub fn can_advance_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Discovered, Registered)
                | (Registered, ChannelEnsured)
                | (Registered, Active)
                | (ChannelEnsured, Active)
                | (Active, TeardownPending)
                | (TeardownPending, Deregistered)
        )
    }
}

/// 设备实例记录
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    handle: InstanceHandle,
    serial_no: Option<u32>,
    state: InstanceState,
}

impl InstanceRecord {
    pub(crate) fn new(handle: InstanceHandle, serial_no: Option<u32>) -> Self {
        Self {
            handle,
            serial_no,
            state: InstanceState::Discovered,
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    /// 序列号；识别失败时为 `None`
    pub fn serial_no(&self) -> Option<u32> {
        self.serial_no
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: InstanceState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.handle
        );
        trace!("{}: {:?} -> {:?}", self.handle, self.state, next);
        self.state = next;
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            handle: self.handle.as_raw(),
            serial_no: self.serial_no,
        }
    }
}

/// 实例记录存储（按句柄索引）
///
/// 只能通过排他锁访问，与注册表同属一个临界区。
#[derive(Debug, Default)]
pub(crate) struct InstanceArena {
    records: HashMap<InstanceHandle, InstanceRecord>,
}

impl InstanceArena {
    pub(crate) fn insert(&mut self, record: InstanceRecord) {
        self.records.insert(record.handle, record);
    }

    pub(crate) fn get(&self, handle: InstanceHandle) -> Option<&InstanceRecord> {
        self.records.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut InstanceRecord> {
        self.records.get_mut(&handle)
    }

    pub(crate) fn remove(&mut self, handle: InstanceHandle) -> Option<InstanceRecord> {
        self.records.remove(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
