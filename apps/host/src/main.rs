//! # Sideband Host
//!
//! 模拟宿主环境：按设备清单挂载一组实例，通过 Unix Domain Socket 提供共享通道，
//! 同时充当用户态查询工具。
//!
//! ```bash
//! # 挂载清单中的实例并提供通道（Ctrl+C 退出时拆除全部实例）
//! sideband-host serve --fleet fleet.toml
//!
//! # 另一个终端：通过别名查询在线实例的序列号
//! sideband-host query
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod fleet;

use commands::{QueryCommand, ServeCommand};

/// Sideband Host - 旁路通道宿主与查询工具
#[derive(Parser, Debug)]
#[command(name = "sideband-host")]
#[command(about = "Simulated host environment and query tool for the sideband filter", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 挂载设备清单并提供共享通道，直到 Ctrl+C
    Serve {
        #[command(flatten)]
        args: ServeCommand,
    },

    /// 通过别名查询在线实例
    Query {
        #[command(flatten)]
        args: QueryCommand,
    },
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sideband_host=info".parse()?)
                .add_directive("sideband_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { args } => args.execute(),
        Commands::Query { args } => args.execute(),
    }
}
