//! 共享通道管理
//!
//! 整个进程只有一个共享通道：注册表从空变为非空时创建，最后一个实例
//! 注销前销毁。存在性判断和创建/销毁动作在同一次排他锁持有期间完成。
//!
//! # 创建协议
//!
//! 1. 分配初始化上下文（非独占访问）
//! 2. 绑定对外地址
//! 3. 发布别名
//! 4. 开始接受请求
//!
//! 第 k 步失败时释放 1..k 步的全部资源。只有第 4 步成功后通道句柄才写入
//! `FleetState::channel`，所以不存在"半初始化的通道被当作可用"的窗口。
//!
//! # 销毁
//!
//! 一次释放：端点的别名、地址和请求入口一起释放，请求队列随之关闭。
//! 分发线程在锁外 join（它在处理请求时也需要这把锁）。

use crate::config::ChannelConfig;
use crate::context::{FleetShared, FleetState};
use crate::error::{SidebandError, TransportError};
use crate::instance::InstanceHandle;
use crate::metrics::SidebandMetrics;
use crate::transport::{ChannelEndpoint, PendingRequest, RequestSender};
use crossbeam_channel::Receiver;
use sideband_protocol::{SidebandRequest, SidebandResponse};
use std::fmt;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 分发线程退出的等待上限
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // watchdog 线程负责 join，超时后由 OS 在进程退出时回收
        std::thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Thread join timeout"),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "Thread panicked during join",
                ),
            )),
        }
    }
}

/// 创建协议中可能失败的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStep {
    BindAddress,
    PublishAlias,
    StartAccepting,
}

impl fmt::Display for CreationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreationStep::BindAddress => "bind-address",
            CreationStep::PublishAlias => "publish-alias",
            CreationStep::StartAccepting => "start-accepting",
        };
        f.write_str(name)
    }
}

/// 通道初始化上下文（创建协议第 1 步）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInit {
    pub address: String,
    pub alias: String,
    /// 是否独占；共享通道总是非独占，任意数量的外部调用者可以同时打开
    pub exclusive: bool,
    pub queue_capacity: usize,
}

impl ChannelInit {
    pub(crate) fn allocate(config: &ChannelConfig) -> Self {
        Self {
            address: config.address.clone(),
            alias: config.alias.clone(),
            exclusive: false,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// 已就绪的共享通道
///
/// 只在创建协议全部成功后构造。
pub struct SharedChannel {
    endpoint: Box<dyn ChannelEndpoint>,
    alias: String,
    queue_tx: Option<RequestSender>,
    worker: Option<JoinHandle<()>>,
}

impl SharedChannel {
    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// 请求队列发送端（进程内查询使用）
    pub(crate) fn request_sender(&self) -> Option<RequestSender> {
        self.queue_tx.clone()
    }

    /// 释放端点并关闭请求队列（在锁内调用）
    ///
    /// 返回的 [`RetiredChannel`] 必须在释放锁之后 `finish()`。
    pub(crate) fn retire(mut self) -> RetiredChannel {
        self.endpoint.release();
        self.queue_tx.take();
        RetiredChannel {
            worker: self.worker.take(),
        }
    }
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        // 未经 retire() 直接丢弃时仍保证释放对外资源；分发线程自行退出
        self.endpoint.release();
        self.queue_tx.take();
    }
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel")
            .field("address", &self.address())
            .field("alias", &self.alias)
            .finish()
    }
}

/// 已释放、等待分发线程退出的通道
#[must_use = "call finish() after releasing the exclusion lock"]
pub(crate) struct RetiredChannel {
    worker: Option<JoinHandle<()>>,
}

impl RetiredChannel {
    /// 等待分发线程退出（必须在锁外调用）
    pub(crate) fn finish(mut self) {
        if let Some(worker) = self.worker.take()
            && let Err(_e) = worker.join_timeout(WORKER_JOIN_TIMEOUT)
        {
            error!(
                "Dispatch thread panicked or failed to shut down within {:?}",
                WORKER_JOIN_TIMEOUT
            );
        }
    }
}

/// 共享通道管理器
///
/// 借用上下文的共享状态；`ensure_*` 和 `dispatch` 各自获取排他锁，
/// `*_locked` 变体供生命周期控制器在已持锁时组合使用。
pub struct ChannelManager<'a> {
    shared: &'a FleetShared,
}

impl<'a> ChannelManager<'a> {
    pub(crate) fn new(shared: &'a FleetShared) -> Self {
        Self { shared }
    }

    /// 确保共享通道存在
    ///
    /// # 返回
    /// - `Ok(true)`: 本次调用创建了通道
    /// - `Ok(false)`: 通道已存在或没有注册实例（无操作）
    /// - `Err(ChannelCreationFailed)`: 创建失败，已回滚（非致命）
    pub fn ensure_created(&self) -> Result<bool, SidebandError> {
        let mut state = self.shared.state.lock();
        self.ensure_created_locked(&mut state)
    }

    pub(crate) fn ensure_created_locked(
        &self,
        state: &mut FleetState,
    ) -> Result<bool, SidebandError> {
        if state.channel.is_some() || state.registry.is_empty() {
            return Ok(false);
        }

        SidebandMetrics::bump(&self.shared.metrics.channel_creations);
        match self.create_channel() {
            Ok(channel) => {
                info!(
                    "Shared channel created at {} (alias {})",
                    channel.address(),
                    channel.alias()
                );
                state.channel = Some(channel);
                Ok(true)
            },
            Err(e) => {
                SidebandMetrics::bump(&self.shared.metrics.channel_creation_failures);
                Err(e)
            },
        }
    }

    /// 执行创建协议（调用者持锁）
    fn create_channel(&self) -> Result<SharedChannel, SidebandError> {
        // 1. 初始化上下文
        let init = ChannelInit::allocate(&self.shared.config.channel);
        debug!("Creating shared channel: {:?}", init);

        // 2. 绑定地址
        let mut endpoint = self.shared.transport.bind(&init).map_err(|source| {
            SidebandError::ChannelCreationFailed {
                step: CreationStep::BindAddress,
                source,
            }
        })?;

        // 3. 发布别名
        if let Err(source) = endpoint.publish_alias(&init.alias) {
            endpoint.release();
            return Err(SidebandError::ChannelCreationFailed {
                step: CreationStep::PublishAlias,
                source,
            });
        }

        // 4. 启动分发线程，再打开请求入口
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(init.queue_capacity);
        let shared = self.shared.this.clone();
        let worker = std::thread::Builder::new()
            .name("sideband-dispatch".to_string())
            .spawn(move || dispatch_loop(shared, queue_rx));
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                endpoint.release();
                return Err(SidebandError::ChannelCreationFailed {
                    step: CreationStep::StartAccepting,
                    source: TransportError::Io(e),
                });
            },
        };

        if let Err(source) = endpoint.start_accepting(queue_tx.clone()) {
            endpoint.release();
            drop(queue_tx);
            // 队列从未对外开放，分发线程不会请求排他锁，可以在锁内等待
            if worker.join_timeout(WORKER_JOIN_TIMEOUT).is_err() {
                error!(
                    "Dispatch thread failed to exit within {:?} after aborted creation",
                    WORKER_JOIN_TIMEOUT
                );
            }
            return Err(SidebandError::ChannelCreationFailed {
                step: CreationStep::StartAccepting,
                source,
            });
        }

        Ok(SharedChannel {
            endpoint,
            alias: init.alias,
            queue_tx: Some(queue_tx),
            worker: Some(worker),
        })
    }

    /// 若 `trigger` 是最后一个实例，销毁共享通道
    ///
    /// 幂等：通道不存在时为无操作。返回本次调用是否销毁了通道。
    pub fn ensure_destroyed(&self, trigger: InstanceHandle) -> bool {
        let retired = {
            let mut state = self.shared.state.lock();
            self.ensure_destroyed_locked(&mut state, trigger)
        };
        match retired {
            Some(retired) => {
                retired.finish();
                true
            },
            None => false,
        }
    }

    /// 锁内部分：计数检查与释放在同一临界区
    pub(crate) fn ensure_destroyed_locked(
        &self,
        state: &mut FleetState,
        trigger: InstanceHandle,
    ) -> Option<RetiredChannel> {
        if !state.registry.is_sole(trigger) {
            return None;
        }
        let channel = state.channel.take()?;
        info!(
            "Deleting shared channel at {} (last instance {})",
            channel.address(),
            trigger
        );
        SidebandMetrics::bump(&self.shared.metrics.channel_destructions);
        Some(channel.retire())
    }

    /// 处理一个到达共享通道的请求
    ///
    /// 持锁期间枚举注册表，响应是一致快照。
    pub fn dispatch(&self, request: SidebandRequest) -> SidebandResponse {
        SidebandMetrics::bump(&self.shared.metrics.queries_dispatched);
        debug!("Request received on shared channel: {:?}", request);

        match request {
            SidebandRequest::EnumerateInstances => {
                let state = self.shared.state.lock();
                let mut instances = Vec::with_capacity(state.registry.count());
                state.registry.for_each(|_, handle| match state.records.get(handle) {
                    Some(record) => {
                        debug!("Serial No: {:?} ({})", record.serial_no(), handle);
                        instances.push(record.summary());
                    },
                    None => warn!("{} registered without a record", handle),
                });
                drop(state);
                SidebandResponse::success(instances)
            },
        }
    }
}

/// 分发线程主循环：串行处理请求队列，直到所有发送端关闭
fn dispatch_loop(shared: Weak<FleetShared>, queue: Receiver<PendingRequest>) {
    for pending in queue.iter() {
        let response = match shared.upgrade() {
            Some(shared) => ChannelManager::new(&shared).dispatch(pending.request),
            None => SidebandResponse::cancelled(),
        };
        // 调用者可能已放弃等待
        let _ = pending.reply.send(response);
    }
    debug!("Dispatch thread exiting");
}
