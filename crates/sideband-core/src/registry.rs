//! 实例注册表
//!
//! 按注册顺序保存所有在线实例的句柄。注册表本身不加锁：它只存在于
//! `FleetState` 内部，所有访问都必须经过排他锁的 guard，因此"调用者持锁"
//! 由类型系统保证。

use crate::error::SidebandError;
use crate::instance::InstanceHandle;

/// 在线实例注册表
///
/// # 不变量
///
/// - 无重复句柄
/// - `count()` 是当前挂载实例数量的唯一依据
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    entries: Vec<InstanceHandle>,
    /// 容量上限（`None` 表示只受内存限制）
    max_instances: Option<usize>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带容量上限的注册表
    pub fn with_limit(max_instances: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            max_instances,
        }
    }

    /// 注册实例
    ///
    /// # 错误
    /// - `DuplicateInstance`: 句柄已注册
    /// - `ResourceExhausted`: 达到容量上限或无法扩容
    pub fn register(&mut self, handle: InstanceHandle) -> Result<(), SidebandError> {
        if self.contains(handle) {
            return Err(SidebandError::DuplicateInstance(handle));
        }

        let count = self.entries.len();
        if let Some(max) = self.max_instances
            && count >= max
        {
            return Err(SidebandError::ResourceExhausted { count });
        }

        self.entries
            .try_reserve(1)
            .map_err(|_| SidebandError::ResourceExhausted { count })?;
        self.entries.push(handle);
        Ok(())
    }

    /// 注销实例（保持其余实例的相对顺序）
    pub fn deregister(&mut self, handle: InstanceHandle) -> Result<(), SidebandError> {
        match self.entries.iter().position(|h| *h == handle) {
            Some(index) => {
                self.entries.remove(index);
                Ok(())
            },
            None => Err(SidebandError::NotFound(handle)),
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.entries.contains(&handle)
    }

    /// `handle` 是否是唯一剩下的实例
    pub fn is_sole(&self, handle: InstanceHandle) -> bool {
        self.entries.len() == 1 && self.entries[0] == handle
    }

    /// 按注册顺序遍历（可重复调用）
    pub fn iter(&self) -> impl Iterator<Item = InstanceHandle> + '_ {
        self.entries.iter().copied()
    }

    /// 按注册顺序访问每个实例，`visitor` 收到 (序号, 句柄)
    pub fn for_each(&self, mut visitor: impl FnMut(usize, InstanceHandle)) {
        for (index, handle) in self.iter().enumerate() {
            visitor(index, handle);
        }
    }
}
