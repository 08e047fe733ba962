//! # Sideband Protocol
//!
//! 共享控制通道（sideband channel）的请求/响应定义（无运行时依赖）
//!
//! ## 线格式
//!
//! 每条消息是一行 JSON（以 `\n` 结尾），请求与响应一一对应：
//!
//! ```text
//! client → {"type":"enumerate_instances"}\n
//! server ← {"status":"success","instances":[{"handle":1,"serial_no":10}]}\n
//! ```
//!
//! 当前只定义一种请求：枚举所有在线实例。无法解码或超过 [`MAX_LINE_LEN`] 的请求行
//! 得到 `{"status":"invalid_request","instances":[]}`。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单行消息的最大字节数（含换行）
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// 控制通道请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidebandRequest {
    /// 枚举当前所有已注册的设备实例（无输入负载）
    EnumerateInstances,
}

/// 请求完成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// 请求已成功完成
    #[default]
    Success,
    /// 通道正在关闭，请求未被处理
    Cancelled,
    /// 请求行无法解析或超长，未被处理
    InvalidRequest,
}

/// 单个实例的摘要信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// 宿主环境分配的实例句柄
    pub handle: u64,
    /// 序列号；识别失败时为 `None`
    pub serial_no: Option<u32>,
}

/// 控制通道响应
///
/// `instances` 按注册顺序排列，是持锁期间拍下的一致快照。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SidebandResponse {
    pub status: CompletionStatus,
    pub instances: Vec<InstanceSummary>,
}

impl SidebandResponse {
    /// 构造成功响应
    pub fn success(instances: Vec<InstanceSummary>) -> Self {
        Self {
            status: CompletionStatus::Success,
            instances,
        }
    }

    /// 构造取消响应（通道在请求排队期间被销毁）
    pub fn cancelled() -> Self {
        Self {
            status: CompletionStatus::Cancelled,
            instances: Vec::new(),
        }
    }

    /// 构造拒绝响应（请求行无法解码）
    pub fn invalid_request() -> Self {
        Self {
            status: CompletionStatus::InvalidRequest,
            instances: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }

    /// 按顺序返回每个实例的序列号
    pub fn serial_numbers(&self) -> Vec<Option<u32>> {
        self.instances.iter().map(|i| i.serial_no).collect()
    }
}

/// 协议编解码错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Empty message")]
    Empty,

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// 将消息编码为一行 JSON（带结尾换行符）
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    if bytes.len() > MAX_LINE_LEN {
        return Err(ProtocolError::TooLong {
            len: bytes.len(),
            max: MAX_LINE_LEN,
        });
    }
    Ok(bytes)
}

/// 从一行文本解码消息（允许结尾的 `\r\n` / `\n`）
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::TooLong {
            len: line.len(),
            max: MAX_LINE_LEN,
        });
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}
