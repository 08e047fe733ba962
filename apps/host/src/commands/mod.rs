//! 子命令实现

pub mod query;
pub mod serve;

pub use query::QueryCommand;
pub use serve::ServeCommand;

use std::path::PathBuf;

/// 获取默认运行目录
///
/// 1. XDG_RUNTIME_DIR（Linux，通常为 /run/user/{uid}）
/// 2. /tmp
pub fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}
