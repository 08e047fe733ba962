//! Unix Domain Socket 传输
//!
//! - 地址：运行目录下的 socket 文件（如 `$XDG_RUNTIME_DIR/toaster_filter.sock`）
//! - 别名：指向 socket 文件的符号链接（如 `$XDG_RUNTIME_DIR/ToasterFilter`）
//! - 非独占：任意数量的客户端可以同时连接，每个连接一个线程，
//!   请求统一进入通道的串行队列
//!
//! 每个连接上按行交换 JSON 消息（见 `sideband-protocol`）。

use super::{ChannelEndpoint, ChannelTransport, RequestSender, submit};
use crate::channel::ChannelInit;
use crate::error::TransportError;
use sideband_protocol::{
    MAX_LINE_LEN, SidebandRequest, SidebandResponse, decode_line, encode_line,
};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// accept / read 轮询间隔（决定释放后线程退出的延迟）
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Unix Domain Socket 传输
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    runtime_dir: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// 地址或别名对应的文件路径
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(name)
    }
}

impl ChannelTransport for UnixSocketTransport {
    fn bind(&self, init: &ChannelInit) -> Result<Box<dyn ChannelEndpoint>, TransportError> {
        let socket_path = self.path_for(&init.address);

        if socket_path.exists() {
            // 能连上说明另一个进程正在使用；否则是上次崩溃残留的文件
            if UnixStream::connect(&socket_path).is_ok() {
                return Err(TransportError::AddressInUse(
                    socket_path.display().to_string(),
                ));
            }
            debug!("Removing stale socket file {}", socket_path.display());
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        if let Err(e) = listener.set_nonblocking(true) {
            let _ = std::fs::remove_file(&socket_path);
            return Err(e.into());
        }

        Ok(Box::new(UnixSocketEndpoint {
            address: init.address.clone(),
            socket_path,
            alias_path: None,
            listener: Some(listener),
            running: Arc::new(AtomicBool::new(false)),
            released: false,
        }))
    }
}

struct UnixSocketEndpoint {
    address: String,
    socket_path: PathBuf,
    alias_path: Option<PathBuf>,
    /// 开始接受请求后移交给 accept 线程
    listener: Option<UnixListener>,
    running: Arc<AtomicBool>,
    released: bool,
}

impl ChannelEndpoint for UnixSocketEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn publish_alias(&mut self, alias: &str) -> Result<(), TransportError> {
        let link = self
            .socket_path
            .parent()
            .map(|dir| dir.join(alias))
            .unwrap_or_else(|| PathBuf::from(alias));

        if let Ok(meta) = link.symlink_metadata() {
            if !meta.file_type().is_symlink() || !is_stale_alias(&link, &self.socket_path) {
                return Err(TransportError::AliasInUse(link.display().to_string()));
            }
            debug!("Removing stale alias {}", link.display());
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(&self.socket_path, &link)?;
        self.alias_path = Some(link);
        Ok(())
    }

    fn start_accepting(&mut self, queue: RequestSender) -> Result<(), TransportError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| TransportError::Unreachable(self.address.clone()))?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let spawned = thread::Builder::new()
            .name("sideband-accept".to_string())
            .spawn(move || accept_loop(listener, queue, running));
        if let Err(e) = spawned {
            self.running.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // accept 线程和连接线程在下一个轮询周期退出，这里不等待
        self.running.store(false, Ordering::Release);
        self.listener.take();

        if let Some(link) = self.alias_path.take()
            && let Err(e) = std::fs::remove_file(&link)
        {
            warn!("Failed to remove alias {}: {}", link.display(), e);
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove socket file {}: {}",
                self.socket_path.display(),
                e
            );
        }
    }
}

impl Drop for UnixSocketEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// 上次崩溃残留的别名：指向本端点的 socket 文件，或指向无人监听的路径
fn is_stale_alias(link: &Path, socket_path: &Path) -> bool {
    if std::fs::read_link(link).is_ok_and(|target| target == socket_path) {
        return true;
    }
    UnixStream::connect(link).is_err()
}

fn accept_loop(listener: UnixListener, queue: RequestSender, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                let queue = queue.clone();
                let running = running.clone();
                let spawned = thread::Builder::new()
                    .name("sideband-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, queue, running) {
                            debug!("Connection closed with error: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn connection thread: {}", e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("Accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            },
        }
    }
    trace!("Accept thread exiting");
}

fn serve_connection(
    stream: UnixStream,
    queue: RequestSender,
    running: Arc<AtomicBool>,
) -> Result<(), TransportError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    while running.load(Ordering::Acquire) {
        // 单行最多读 MAX_LINE_LEN + 1 字节，超出即判定为超长
        let budget = (MAX_LINE_LEN + 1).saturating_sub(line.len()) as u64;
        match reader.by_ref().take(budget).read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line.len() > MAX_LINE_LEN => {
                warn!("Request line exceeds {} bytes, closing connection", MAX_LINE_LEN);
                write_response(&mut writer, &SidebandResponse::invalid_request())?;
                break;
            },
            // 没有换行：对端已关闭写端，下一次读取返回 0
            Ok(_) if !line.ends_with('\n') => continue,
            Ok(_) => {
                let decoded = decode_line::<SidebandRequest>(&line);
                line.clear();

                let response = match decoded {
                    Ok(request) => match submit(&queue, request) {
                        Ok(response) => response,
                        Err(TransportError::QueueClosed) => SidebandResponse::cancelled(),
                        Err(e) => return Err(e),
                    },
                    Err(e) => {
                        warn!("Rejecting malformed request: {}", e);
                        SidebandResponse::invalid_request()
                    },
                };
                write_response(&mut writer, &response)?;
            },
            // 超时时 `line` 保留已读到的部分，下次继续拼接
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_response(writer: &mut UnixStream, response: &SidebandResponse) -> Result<(), TransportError> {
    writer.write_all(&encode_line(response)?)?;
    writer.flush()?;
    Ok(())
}

/// 连接到 `path`（socket 文件或别名）并发送"枚举在线实例"请求
///
/// 文件不存在或无人监听时返回 `Unreachable`。
pub fn query_socket(
    path: impl AsRef<Path>,
    timeout: Duration,
) -> Result<SidebandResponse, TransportError> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            TransportError::Unreachable(path.display().to_string())
        },
        _ => TransportError::Io(e),
    })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut writer = stream.try_clone()?;
    writer.write_all(&encode_line(&SidebandRequest::EnumerateInstances)?)?;
    writer.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(TransportError::Unreachable(path.display().to_string()));
    }
    Ok(decode_line(&line)?)
}
