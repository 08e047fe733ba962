//! 核心层错误类型定义

use crate::channel::CreationStep;
use crate::instance::InstanceHandle;
use sideband_protocol::ProtocolError;
use thiserror::Error;

/// 传输层错误类型
///
/// 由 `ChannelTransport` / `ChannelEndpoint` 的实现返回，也用于客户端查询。
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 地址已被其他端点占用
    #[error("Address already bound: {0}")]
    AddressInUse(String),

    /// 别名已被发布
    #[error("Alias already published: {0}")]
    AliasInUse(String),

    /// 通道不存在（未创建或已销毁）
    #[error("Channel unreachable: {0}")]
    Unreachable(String),

    /// 通道已绑定但尚未开始接受请求
    #[error("Channel is not accepting requests yet")]
    NotAccepting,

    /// 请求队列已关闭（通道正在销毁）
    #[error("Request queue closed")]
    QueueClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 注入的故障（仅内存传输用于测试回滚路径）
    #[error("Injected failure at step: {0}")]
    Injected(CreationStep),
}

/// 核心层错误类型
#[derive(Error, Debug)]
pub enum SidebandError {
    /// 注册表无法扩容（或达到配置的上限），该实例无法被跟踪
    #[error("Registry exhausted ({count} instances registered)")]
    ResourceExhausted { count: usize },

    /// 共享通道创建协议的某一步失败（已回滚，不影响实例挂载）
    #[error("Shared channel creation failed at {step}: {source}")]
    ChannelCreationFailed {
        step: CreationStep,
        #[source]
        source: TransportError,
    },

    /// 注销未知实例
    #[error("Instance not found: {0}")]
    NotFound(InstanceHandle),

    /// 同一句柄重复注册
    #[error("Instance already registered: {0}")]
    DuplicateInstance(InstanceHandle),

    /// 宿主环境无法提供序列号
    #[error("Failed to identify instance {handle}: {reason}")]
    IdentificationFailed {
        handle: InstanceHandle,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 关闭时仍有实例未能拆除
    #[error("Shutdown incomplete: {remaining} instances still registered")]
    ShutdownIncomplete { remaining: usize },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl SidebandError {
    /// 是否为致命错误（导致本次操作失败）
    ///
    /// 通道创建失败、识别失败、注销未知实例都只记录日志，不影响实例挂载。
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SidebandError::ChannelCreationFailed { .. }
                | SidebandError::NotFound(_)
                | SidebandError::IdentificationFailed { .. }
        )
    }
}
