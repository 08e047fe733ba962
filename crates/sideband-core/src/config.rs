//! 配置
//!
//! 从 TOML 加载，所有字段都有默认值：
//!
//! ```toml
//! [channel]
//! address = "toaster_filter.sock"
//! alias = "ToasterFilter"
//! queue_capacity = 16
//!
//! [registry]
//! max_instances = 64
//! ```

use crate::error::SidebandError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 共享通道配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// 通道绑定地址（对外可见）
    pub address: String,
    /// 发布的别名（解析到 `address`）
    pub alias: String,
    /// 请求队列容量
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            address: "toaster_filter.sock".to_string(),
            alias: "ToasterFilter".to_string(),
            queue_capacity: 16,
        }
    }
}

/// 注册表配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// 最大实例数（`None` 表示不限制）
    pub max_instances: Option<usize>,
}

/// 顶层配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidebandConfig {
    pub channel: ChannelConfig,
    pub registry: RegistryConfig,
}

impl SidebandConfig {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, SidebandError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SidebandError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SidebandError> {
        let channel = &self.channel;
        if channel.address.trim().is_empty() {
            return Err(SidebandError::InvalidConfig(
                "channel.address must not be empty".to_string(),
            ));
        }
        if channel.alias.trim().is_empty() {
            return Err(SidebandError::InvalidConfig(
                "channel.alias must not be empty".to_string(),
            ));
        }
        if channel.alias == channel.address {
            return Err(SidebandError::InvalidConfig(
                "channel.alias must differ from channel.address".to_string(),
            ));
        }
        if channel.queue_capacity == 0 {
            return Err(SidebandError::InvalidConfig(
                "channel.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.registry.max_instances == Some(0) {
            return Err(SidebandError::InvalidConfig(
                "registry.max_instances must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
