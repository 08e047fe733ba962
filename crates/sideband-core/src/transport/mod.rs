//! 传输层抽象
//!
//! 共享通道的命名/寻址由传输层负责，核心层只使用三个原语：
//! 绑定地址（`bind`）、发布别名（`publish_alias`）、释放全部（`release`），
//! 外加开始接受请求（`start_accepting`）。
//!
//! 传输层收到请求后通过 [`RequestSender`] 投递到通道的串行请求队列，
//! 并阻塞等待对应的响应。
//!
//! - [`MemoryTransport`]: 进程内命名空间，支持故障注入
//! - [`UnixSocketTransport`]: Unix Domain Socket + 符号链接别名（仅 Unix）

use crate::channel::ChannelInit;
use crate::error::TransportError;
use crossbeam_channel::{Receiver, Sender};
use sideband_protocol::{SidebandRequest, SidebandResponse};

pub mod memory;
#[cfg(unix)]
pub mod uds;

pub use memory::{MemoryClient, MemoryTransport};
#[cfg(unix)]
pub use uds::{UnixSocketTransport, query_socket};

/// 排队中的请求（附带一次性回复通道）
#[derive(Debug)]
pub struct PendingRequest {
    pub request: SidebandRequest,
    pub reply: Sender<SidebandResponse>,
}

impl PendingRequest {
    pub fn new(request: SidebandRequest) -> (Self, Receiver<SidebandResponse>) {
        let (reply, rx) = crossbeam_channel::bounded(1);
        (Self { request, reply }, rx)
    }
}

/// 串行请求队列的发送端
pub type RequestSender = Sender<PendingRequest>;

/// 投递请求并等待响应
///
/// 队列关闭（通道已销毁）时返回 `QueueClosed`。
pub fn submit(
    queue: &RequestSender,
    request: SidebandRequest,
) -> Result<SidebandResponse, TransportError> {
    let (pending, rx) = PendingRequest::new(request);
    queue
        .send(pending)
        .map_err(|_| TransportError::QueueClosed)?;
    rx.recv().map_err(|_| TransportError::QueueClosed)
}

/// 共享通道的传输层
pub trait ChannelTransport: Send + Sync {
    /// 创建协议第 2 步：把通道绑定到对外地址
    fn bind(&self, init: &ChannelInit) -> Result<Box<dyn ChannelEndpoint>, TransportError>;
}

/// 已绑定的通道端点
///
/// `release()` 一次性释放别名、地址和请求入口，必须幂等；
/// 实现应在 `Drop` 中调用它。`release()` 在排他锁内调用，不得阻塞等待
/// 正在处理的请求。
pub trait ChannelEndpoint: Send {
    fn address(&self) -> &str;

    /// 创建协议第 3 步：发布解析到本地址的别名
    fn publish_alias(&mut self, alias: &str) -> Result<(), TransportError>;

    /// 创建协议第 4 步：开始接受请求，之前到达的请求由传输层拒绝
    fn start_accepting(&mut self, queue: RequestSender) -> Result<(), TransportError>;

    fn release(&mut self);
}
