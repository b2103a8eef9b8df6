//! Boundary to the parent hypervisor supervisor.

use std::sync::Mutex;

use async_trait::async_trait;
use volary_bus::Jid;

/// What the agent needs from the supervisor that spawned it.
///
/// The supervisor owns agent lifecycles: freeing an agent makes it call
/// `terminate` and remove the VM folder, and after a successful outbound
/// migration it unregisters the agent.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// The supervisor's own bus address.
    fn jid(&self) -> &Jid;

    /// The cached hypervisor capabilities document.
    fn capabilities(&self) -> &str;

    /// Fully remove the VM behind `vm` from this hypervisor.
    async fn free(&self, vm: &Jid) -> anyhow::Result<()>;
}

/// Recording supervisor for tests.
pub struct MockSupervisor {
    jid: Jid,
    capabilities: String,
    freed: Mutex<Vec<Jid>>,
}

impl MockSupervisor {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            capabilities: "<capabilities><host/></capabilities>".to_string(),
            freed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl Into<String>) -> Self {
        self.capabilities = capabilities.into();
        self
    }

    /// Addresses of agents freed so far.
    pub fn freed(&self) -> Vec<Jid> {
        self.freed.lock().expect("mock poisoned").clone()
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn jid(&self) -> &Jid {
        &self.jid
    }

    fn capabilities(&self) -> &str {
        &self.capabilities
    }

    async fn free(&self, vm: &Jid) -> anyhow::Result<()> {
        self.freed.lock().expect("mock poisoned").push(vm.clone());
        Ok(())
    }
}
