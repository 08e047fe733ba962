//! 通道与生命周期指标
//!
//! 原子计数器，可以在任何线程读取，不依赖排他锁。

use std::sync::atomic::{AtomicU64, Ordering};

/// 运行时指标
#[derive(Debug, Default)]
pub struct SidebandMetrics {
    /// 执行创建协议的次数（无论成功与否）
    pub channel_creations: AtomicU64,

    /// 创建协议失败次数（已回滚）
    pub channel_creation_failures: AtomicU64,

    /// 共享通道销毁次数
    pub channel_destructions: AtomicU64,

    /// 分发的查询请求数
    pub queries_dispatched: AtomicU64,

    /// 序列号识别失败次数
    pub identification_failures: AtomicU64,

    /// 挂载失败次数（注册表拒绝）
    pub attach_failures: AtomicU64,

    /// 注销未知实例的次数
    pub deregister_not_found: AtomicU64,
}

impl SidebandMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channel_creations: self.channel_creations.load(Ordering::Relaxed),
            channel_creation_failures: self.channel_creation_failures.load(Ordering::Relaxed),
            channel_destructions: self.channel_destructions.load(Ordering::Relaxed),
            queries_dispatched: self.queries_dispatched.load(Ordering::Relaxed),
            identification_failures: self.identification_failures.load(Ordering::Relaxed),
            attach_failures: self.attach_failures.load(Ordering::Relaxed),
            deregister_not_found: self.deregister_not_found.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照（不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub channel_creations: u64,
    pub channel_creation_failures: u64,
    pub channel_destructions: u64,
    pub queries_dispatched: u64,
    pub identification_failures: u64,
    pub attach_failures: u64,
    pub deregister_not_found: u64,
}

impl MetricsSnapshot {
    /// 成功创建的通道数
    pub fn channels_created(&self) -> u64 {
        self.channel_creations
            .saturating_sub(self.channel_creation_failures)
    }
}
