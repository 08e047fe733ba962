//! 进程内传输
//!
//! 用一张进程内命名表模拟地址/别名空间，便于在没有真实 IPC 的环境下驱动
//! 完整的创建/销毁协议。支持对创建协议的某一步注入一次性故障。
//!
//! ```rust
//! use sideband_core::transport::MemoryTransport;
//! use sideband_core::TransportError;
//!
//! let transport = MemoryTransport::new();
//! let err = transport.connect("ToasterFilter").enumerate().unwrap_err();
//! assert!(matches!(err, TransportError::Unreachable(_)));
//! ```

use super::{ChannelEndpoint, ChannelTransport, RequestSender, submit};
use crate::channel::{ChannelInit, CreationStep};
use crate::error::TransportError;
use parking_lot::Mutex;
use sideband_protocol::{SidebandRequest, SidebandResponse};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct AddressSlot {
    exclusive: bool,
    /// `None` 表示已绑定但尚未开始接受请求
    queue: Option<RequestSender>,
}

#[derive(Debug, Default)]
struct Namespace {
    addresses: HashMap<String, AddressSlot>,
    /// alias -> address
    aliases: HashMap<String, String>,
    /// 一次性故障
    fault: Option<CreationStep>,
}

impl Namespace {
    fn take_fault(&mut self, step: CreationStep) -> Result<(), TransportError> {
        if self.fault == Some(step) {
            self.fault = None;
            return Err(TransportError::Injected(step));
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<&AddressSlot> {
        let address = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.addresses.get(address)
    }
}

/// 进程内传输（克隆后共享同一命名表）
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    namespace: Arc<Mutex<Namespace>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让创建协议的 `step` 在下一次执行时失败
    pub fn fail_step(&self, step: CreationStep) {
        self.namespace.lock().fault = Some(step);
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.namespace.lock().addresses.contains_key(address)
    }

    /// 别名解析到的地址
    pub fn alias_target(&self, alias: &str) -> Option<String> {
        self.namespace.lock().aliases.get(alias).cloned()
    }

    /// 地址是否以独占方式绑定
    pub fn is_exclusive(&self, address: &str) -> Option<bool> {
        self.namespace
            .lock()
            .addresses
            .get(address)
            .map(|slot| slot.exclusive)
    }

    /// 打开一个客户端（按别名或地址寻址，连接在每次请求时解析）
    pub fn connect(&self, name: &str) -> MemoryClient {
        MemoryClient {
            namespace: self.namespace.clone(),
            name: name.to_string(),
        }
    }
}

impl ChannelTransport for MemoryTransport {
    fn bind(&self, init: &ChannelInit) -> Result<Box<dyn ChannelEndpoint>, TransportError> {
        let mut ns = self.namespace.lock();
        ns.take_fault(CreationStep::BindAddress)?;
        if ns.addresses.contains_key(&init.address) {
            return Err(TransportError::AddressInUse(init.address.clone()));
        }
        ns.addresses.insert(
            init.address.clone(),
            AddressSlot {
                exclusive: init.exclusive,
                queue: None,
            },
        );
        Ok(Box::new(MemoryEndpoint {
            namespace: self.namespace.clone(),
            address: init.address.clone(),
            alias: None,
            released: false,
        }))
    }
}

struct MemoryEndpoint {
    namespace: Arc<Mutex<Namespace>>,
    address: String,
    alias: Option<String>,
    released: bool,
}

impl ChannelEndpoint for MemoryEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn publish_alias(&mut self, alias: &str) -> Result<(), TransportError> {
        let mut ns = self.namespace.lock();
        ns.take_fault(CreationStep::PublishAlias)?;
        if ns.aliases.contains_key(alias) {
            return Err(TransportError::AliasInUse(alias.to_string()));
        }
        ns.aliases.insert(alias.to_string(), self.address.clone());
        self.alias = Some(alias.to_string());
        Ok(())
    }

    fn start_accepting(&mut self, queue: RequestSender) -> Result<(), TransportError> {
        let mut ns = self.namespace.lock();
        ns.take_fault(CreationStep::StartAccepting)?;
        let slot = ns
            .addresses
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::Unreachable(self.address.clone()))?;
        slot.queue = Some(queue);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut ns = self.namespace.lock();
        if let Some(alias) = self.alias.take() {
            ns.aliases.remove(&alias);
        }
        // 丢弃 slot 中的队列发送端
        ns.addresses.remove(&self.address);
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// 进程内客户端
#[derive(Debug, Clone)]
pub struct MemoryClient {
    namespace: Arc<Mutex<Namespace>>,
    name: String,
}

impl MemoryClient {
    /// 发送"枚举在线实例"请求
    pub fn enumerate(&self) -> Result<SidebandResponse, TransportError> {
        self.request(SidebandRequest::EnumerateInstances)
    }

    pub fn request(&self, request: SidebandRequest) -> Result<SidebandResponse, TransportError> {
        let queue = {
            let ns = self.namespace.lock();
            let slot = ns
                .resolve(&self.name)
                .ok_or_else(|| TransportError::Unreachable(self.name.clone()))?;
            slot.queue.clone().ok_or(TransportError::NotAccepting)?
        };
        submit(&queue, request)
    }
}
