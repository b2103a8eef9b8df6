//! Mock hypervisor driver for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{DriverError, Result};
use crate::traits::{Driver, EventStream};
use crate::types::*;
use crate::xml::DomainXml;

/// In-memory domain record held by the mock driver.
#[derive(Debug, Clone)]
pub struct MockDomain {
    pub xml: String,
    pub state: DomainState,
    pub id: i32,
    pub autostart: bool,
    pub max_mem_kib: u64,
    pub memory_kib: u64,
    pub nr_virt_cpu: u32,
    pub max_vcpus: u32,
    pub cpu_time_ns: u64,
    /// Interface counters keyed by host-side target device.
    pub interfaces: HashMap<String, InterfaceStats>,
}

impl MockDomain {
    pub fn new(xml: impl Into<String>) -> Self {
        Self {
            xml: xml.into(),
            state: DomainState::ShutOff,
            id: -1,
            autostart: false,
            max_mem_kib: 1_048_576,
            memory_kib: 1_048_576,
            nr_virt_cpu: 2,
            max_vcpus: 8,
            cpu_time_ns: 0,
            interfaces: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: DomainState) -> Self {
        self.state = state;
        self
    }

    pub fn with_interface(mut self, device: impl Into<String>, stats: InterfaceStats) -> Self {
        self.interfaces.insert(device.into(), stats);
        self
    }
}

/// Mock hypervisor driver.
///
/// Simulates domain operations in memory without a hypervisor. State changes
/// apply immediately; lifecycle events are never emitted spontaneously — a
/// test drives the asynchronous path explicitly through [`MockDriver::emit`].
pub struct MockDriver {
    kind: DriverKind,
    uri: String,
    domains: RwLock<HashMap<String, MockDomain>>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<DomainEvent>>>,
    next_stream_id: AtomicU64,
    next_domain_id: AtomicI32,
    failures: Mutex<HashMap<&'static str, DriverError>>,
    migrations: Mutex<Vec<(String, String, u32)>>,
}

impl MockDriver {
    pub fn new(kind: DriverKind) -> Self {
        info!(kind = kind.as_str(), "creating mock hypervisor driver");
        Self {
            kind,
            uri: format!("{}://mock/system", kind.as_str()),
            domains: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            next_domain_id: AtomicI32::new(1),
            failures: Mutex::new(HashMap::new()),
            migrations: Mutex::new(Vec::new()),
        }
    }

    /// Register a domain record under the given UUID.
    pub fn add_domain(&self, uuid: impl Into<String>, domain: MockDomain) {
        self.domains
            .write()
            .expect("domain table poisoned")
            .insert(uuid.into(), domain);
    }

    /// Run `f` over the stored record, if any.
    pub fn inspect_domain<T>(&self, uuid: &str, f: impl FnOnce(&MockDomain) -> T) -> Option<T> {
        self.domains
            .read()
            .expect("domain table poisoned")
            .get(uuid)
            .map(f)
    }

    /// Migration calls recorded so far, as (uuid, target uri, flags).
    pub fn migrations(&self) -> Vec<(String, String, u32)> {
        self.migrations.lock().expect("migration log poisoned").clone()
    }

    /// Arrange for the next call of `op` to fail with `err`.
    pub fn inject_failure(&self, op: &'static str, err: DriverError) {
        self.failures
            .lock()
            .expect("failure table poisoned")
            .insert(op, err);
    }

    /// Deliver a lifecycle event to every open subscription.
    pub fn emit(&self, event: DomainEvent) {
        let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        for tx in subscribers.values() {
            let _ = tx.send(event);
        }
    }

    fn fail(&self, op: &'static str) -> Result<()> {
        let injected = self
            .failures
            .lock()
            .expect("failure table poisoned")
            .remove(op);
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_domain<T>(&self, uuid: &str, f: impl FnOnce(&MockDomain) -> T) -> Result<T> {
        let domains = self
            .domains
            .read()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?;
        domains
            .get(uuid)
            .map(f)
            .ok_or_else(|| DriverError::NoDomain(uuid.to_string()))
    }

    fn with_domain_mut<T>(&self, uuid: &str, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        let mut domains = self
            .domains
            .write()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?;
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| DriverError::NoDomain(uuid.to_string()))?;
        f(domain)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn domain_exists(&self, uuid: &str) -> Result<bool> {
        let domains = self
            .domains
            .read()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?;
        Ok(domains.contains_key(uuid))
    }

    async fn domain_id(&self, uuid: &str) -> Result<i32> {
        self.with_domain(uuid, |d| d.id)
    }

    async fn domain_info(&self, uuid: &str) -> Result<DomainInfo> {
        self.fail("domain_info")?;
        self.with_domain(uuid, |d| DomainInfo {
            state: d.state,
            max_mem_kib: d.max_mem_kib,
            memory_kib: d.memory_kib,
            nr_virt_cpu: d.nr_virt_cpu,
            cpu_time_ns: d.cpu_time_ns,
        })
    }

    async fn xml_desc(&self, uuid: &str, _secure: bool) -> Result<String> {
        self.fail("xml_desc")?;
        self.with_domain(uuid, |d| d.xml.clone())
    }

    async fn create(&self, uuid: &str) -> Result<()> {
        self.fail("create")?;
        let id = self.next_domain_id.fetch_add(1, Ordering::SeqCst);
        self.with_domain_mut(uuid, |d| {
            if d.state.is_active() {
                return Err(DriverError::OperationInvalid(
                    "domain is already running".to_string(),
                ));
            }
            d.state = DomainState::Running;
            d.id = id;
            d.memory_kib = d.max_mem_kib;
            Ok(())
        })?;
        debug!(uuid = %uuid, id, "mock domain started");
        Ok(())
    }

    async fn shutdown(&self, uuid: &str) -> Result<()> {
        self.fail("shutdown")?;
        self.with_domain_mut(uuid, |d| {
            if !d.state.is_active() {
                return Err(DriverError::OperationInvalid(
                    "domain is not running".to_string(),
                ));
            }
            d.state = DomainState::ShutOff;
            d.id = -1;
            Ok(())
        })
    }

    async fn destroy(&self, uuid: &str) -> Result<()> {
        self.fail("destroy")?;
        self.with_domain_mut(uuid, |d| {
            d.state = DomainState::ShutOff;
            d.id = -1;
            Ok(())
        })
    }

    async fn reboot(&self, uuid: &str) -> Result<()> {
        self.fail("reboot")?;
        self.with_domain(uuid, |_| ())
    }

    async fn suspend(&self, uuid: &str) -> Result<()> {
        self.fail("suspend")?;
        self.with_domain_mut(uuid, |d| {
            if !d.state.is_active() {
                return Err(DriverError::OperationInvalid(
                    "domain is not running".to_string(),
                ));
            }
            d.state = DomainState::Paused;
            Ok(())
        })
    }

    async fn resume(&self, uuid: &str) -> Result<()> {
        self.fail("resume")?;
        self.with_domain_mut(uuid, |d| {
            if d.state != DomainState::Paused {
                return Err(DriverError::OperationInvalid(
                    "domain is not paused".to_string(),
                ));
            }
            d.state = DomainState::Running;
            Ok(())
        })
    }

    async fn define_xml(&self, xml: &str) -> Result<()> {
        self.fail("define_xml")?;
        let uuid = DomainXml::new(xml)
            .uuid()?
            .ok_or_else(|| DriverError::Xml("document has no uuid element".to_string()))?;
        let mut domains = self
            .domains
            .write()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?;
        match domains.get_mut(&uuid) {
            Some(existing) => existing.xml = xml.to_string(),
            None => {
                domains.insert(uuid.clone(), MockDomain::new(xml));
            }
        }
        debug!(uuid = %uuid, "mock domain defined");
        Ok(())
    }

    async fn undefine(&self, uuid: &str) -> Result<()> {
        self.fail("undefine")?;
        let mut domains = self
            .domains
            .write()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?;
        domains
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| DriverError::NoDomain(uuid.to_string()))
    }

    async fn autostart(&self, uuid: &str) -> Result<bool> {
        self.fail("autostart")?;
        self.with_domain(uuid, |d| d.autostart)
    }

    async fn set_autostart(&self, uuid: &str, autostart: bool) -> Result<()> {
        self.fail("set_autostart")?;
        self.with_domain_mut(uuid, |d| {
            d.autostart = autostart;
            Ok(())
        })
    }

    async fn set_memory(&self, uuid: &str, kib: u64) -> Result<()> {
        self.fail("set_memory")?;
        self.with_domain_mut(uuid, |d| {
            d.memory_kib = kib.min(d.max_mem_kib);
            Ok(())
        })
    }

    async fn max_vcpus(&self, uuid: &str) -> Result<u32> {
        self.with_domain(uuid, |d| d.max_vcpus)
    }

    async fn set_vcpus(&self, uuid: &str, count: u32) -> Result<()> {
        self.fail("set_vcpus")?;
        self.with_domain_mut(uuid, |d| {
            if count > d.max_vcpus {
                return Err(DriverError::OperationInvalid(format!(
                    "requested {} vcpus, maximum is {}",
                    count, d.max_vcpus
                )));
            }
            d.nr_virt_cpu = count;
            Ok(())
        })
    }

    async fn interface_stats(&self, uuid: &str, device: &str) -> Result<InterfaceStats> {
        self.fail("interface_stats")?;
        self.with_domain(uuid, |d| d.interfaces.get(device).copied())?
            .ok_or_else(|| DriverError::OperationFailed(format!("no such device: {}", device)))
    }

    async fn migrate_to_uri(
        &self,
        uuid: &str,
        uri: &str,
        flags: u32,
        bandwidth_mbps: u64,
    ) -> Result<()> {
        self.fail("migrate_to_uri")?;
        debug!(uuid = %uuid, target = %uri, flags, bandwidth_mbps, "mock migration");
        self.with_domain(uuid, |_| ())?;
        self.migrations
            .lock()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?
            .push((uuid.to_string(), uri.to_string(), flags));
        Ok(())
    }

    async fn open_events(&self, uuid: &str) -> Result<EventStream> {
        self.with_domain(uuid, |_| ())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?
            .insert(id, tx);
        debug!(uuid = %uuid, stream_id = id, "mock event stream opened");
        Ok(EventStream { id, events: rx })
    }

    async fn close_events(&self, id: u64) -> Result<()> {
        self.subscribers
            .lock()
            .map_err(|_| DriverError::Internal("lock poisoned".to_string()))?
            .remove(&id);
        debug!(stream_id = id, "mock event stream closed");
        Ok(())
    }
}
