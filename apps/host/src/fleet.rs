//! 设备清单
//!
//! 描述模拟宿主环境中要挂载的实例，按文件顺序挂载：
//!
//! ```toml
//! [[instance]]
//! handle = 1
//! serial = 10
//!
//! [[instance]]
//! handle = 2
//! # 不写 serial：模拟总线驱动没有报告序列号的设备
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sideband_core::{DeviceProperties, InstanceHandle, SidebandError};
use std::collections::HashSet;
use std::path::Path;

/// 清单中的一个设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetDevice {
    pub handle: u64,
    #[serde(default)]
    pub serial: Option<u32>,
}

impl FleetDevice {
    pub fn instance_handle(&self) -> InstanceHandle {
        InstanceHandle::new(self.handle)
    }
}

impl DeviceProperties for FleetDevice {
    fn serial_number(&self, handle: InstanceHandle) -> Result<u32, SidebandError> {
        self.serial.ok_or_else(|| SidebandError::IdentificationFailed {
            handle,
            reason: "UI number property missing".to_string(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fleet {
    #[serde(default, rename = "instance")]
    pub devices: Vec<FleetDevice>,
}

impl Fleet {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let fleet: Fleet = toml::from_str(text).context("Failed to parse fleet file")?;

        let mut seen = HashSet::new();
        for device in &fleet.devices {
            if !seen.insert(device.handle) {
                bail!("Duplicate handle {} in fleet file", device.handle);
            }
        }
        Ok(fleet)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// 未提供清单时的默认设备：一个带序列号的实例
    pub fn single() -> Self {
        Self {
            devices: vec![FleetDevice {
                handle: 1,
                serial: Some(10),
            }],
        }
    }
}
