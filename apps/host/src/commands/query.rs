//! query 命令（用户态工具）

use anyhow::{Context, Result, bail};
use clap::Args;
use sideband_core::transport::query_socket;
use sideband_protocol::{CompletionStatus, SidebandResponse};
use std::path::PathBuf;
use std::time::Duration;

/// query 参数
#[derive(Args, Debug)]
pub struct QueryCommand {
    /// socket 文件和别名所在目录
    #[arg(long)]
    pub runtime_dir: Option<PathBuf>,

    /// 要打开的别名（或地址）
    #[arg(long, default_value = "ToasterFilter")]
    pub alias: String,

    /// 超时（毫秒）
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

impl QueryCommand {
    pub fn execute(self) -> Result<()> {
        let runtime_dir = self.runtime_dir.unwrap_or_else(super::default_runtime_dir);
        let path = runtime_dir.join(&self.alias);

        let response = query_socket(&path, Duration::from_millis(self.timeout_ms))
            .with_context(|| format!("Failed to query {}", path.display()))?;

        match response.status {
            CompletionStatus::Success => {},
            CompletionStatus::Cancelled => bail!("Request cancelled: channel is shutting down"),
            CompletionStatus::InvalidRequest => bail!("Request rejected by the channel"),
        }
        print!("{}", render(&response));
        Ok(())
    }
}

fn render(response: &SidebandResponse) -> String {
    let mut out = format!("{} instances\n", response.instances.len());
    for instance in &response.instances {
        match instance.serial_no {
            Some(serial) => out.push_str(&format!("  Serial No: {}\n", serial)),
            None => out.push_str("  Serial No: <unknown>\n"),
        }
    }
    out
}
