//! serve 命令
//!
//! 按清单顺序投递"实例出现"事件，阻塞直到 Ctrl+C，然后按注册顺序拆除。

use crate::fleet::Fleet;
use anyhow::{Context, Result};
use clap::Args;
use sideband_core::transport::UnixSocketTransport;
use sideband_core::{HostEvents, SidebandConfig, SidebandContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// serve 参数
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// 通道配置文件（TOML，可选）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 设备清单（TOML，可选；默认挂载一个序列号为 10 的实例）
    #[arg(short, long)]
    pub fleet: Option<PathBuf>,

    /// socket 文件和别名所在目录
    ///
    /// 默认: XDG_RUNTIME_DIR 或系统临时目录
    #[arg(long)]
    pub runtime_dir: Option<PathBuf>,
}

impl ServeCommand {
    pub fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => SidebandConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SidebandConfig::default(),
        };
        let fleet = match &self.fleet {
            Some(path) => Fleet::load(path)?,
            None => Fleet::single(),
        };
        let runtime_dir = self.runtime_dir.unwrap_or_else(super::default_runtime_dir);
        std::fs::create_dir_all(&runtime_dir).with_context(|| {
            format!("Failed to create runtime dir {}", runtime_dir.display())
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        ctrlc::set_handler(move || {
            flag.store(false, Ordering::Release);
        })
        .context("Failed to set signal handler")?;

        let transport = UnixSocketTransport::new(&runtime_dir);
        let alias_path = transport.path_for(&config.channel.alias);
        let ctx = SidebandContext::new(config, Arc::new(transport))?;

        for device in &fleet.devices {
            let handle = device.instance_handle();
            if let Err(e) = ctx.on_instance_appears(handle, device) {
                warn!("Failed to attach {}: {}", handle, e);
            }
        }

        info!(
            "{} instances attached, channel {}",
            ctx.instance_count(),
            match ctx.channel_address() {
                Some(_) => format!("available at {}", alias_path.display()),
                None => "unavailable".to_string(),
            }
        );
        info!("Press Ctrl+C to stop");

        while running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));
        }

        info!("Shutting down, metrics: {:?}", ctx.metrics());
        ctx.shutdown().context("Shutdown did not complete cleanly")?;
        Ok(())
    }
}
