//! Core hypervisor driver trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::*;

/// A live subscription to a domain's lifecycle events.
///
/// The stream ends when the driver closes it (see `Driver::close_events`).
pub struct EventStream {
    /// Subscription identifier, used to deregister.
    pub id: u64,
    /// Channel delivering events in the order the driver observed them.
    pub events: mpsc::UnboundedReceiver<DomainEvent>,
}

/// Driver interface to a single hypervisor connection.
///
/// All domain-scoped operations take the domain UUID in its canonical string
/// form. Implementations must be safe to share across tasks; calls may block
/// on the underlying hypervisor.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The hypervisor family this driver talks to.
    fn kind(&self) -> DriverKind;

    /// The driver connection URI, as used for peer-to-peer migration.
    fn uri(&self) -> &str;

    // =========================================================================
    // Lookup & status
    // =========================================================================

    /// Check whether a domain with this UUID is known to the hypervisor.
    async fn domain_exists(&self, uuid: &str) -> Result<bool>;

    /// Hypervisor-assigned numeric id of a running domain.
    async fn domain_id(&self, uuid: &str) -> Result<i32>;

    /// Current runtime counters and state.
    async fn domain_info(&self, uuid: &str) -> Result<DomainInfo>;

    /// The domain XML description. With `secure` set the document includes
    /// protected elements the hypervisor would otherwise withhold.
    async fn xml_desc(&self, uuid: &str, secure: bool) -> Result<String>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a defined domain.
    async fn create(&self, uuid: &str) -> Result<()>;

    /// Request a graceful in-guest shutdown.
    async fn shutdown(&self, uuid: &str) -> Result<()>;

    /// Immediately terminate the domain.
    async fn destroy(&self, uuid: &str) -> Result<()>;

    /// Request an in-guest reboot.
    async fn reboot(&self, uuid: &str) -> Result<()>;

    /// Freeze execution.
    async fn suspend(&self, uuid: &str) -> Result<()>;

    /// Unfreeze execution.
    async fn resume(&self, uuid: &str) -> Result<()>;

    // =========================================================================
    // Definition
    // =========================================================================

    /// Define (or redefine) a domain from its XML description.
    async fn define_xml(&self, xml: &str) -> Result<()>;

    /// Remove the persistent definition of a domain.
    async fn undefine(&self, uuid: &str) -> Result<()>;

    // =========================================================================
    // Tuning
    // =========================================================================

    /// Whether the domain starts with the host.
    async fn autostart(&self, uuid: &str) -> Result<bool>;

    /// Set whether the domain starts with the host.
    async fn set_autostart(&self, uuid: &str, autostart: bool) -> Result<()>;

    /// Change the domain's memory allocation, in KiB.
    async fn set_memory(&self, uuid: &str, kib: u64) -> Result<()>;

    /// Maximum number of virtual CPUs the domain supports.
    async fn max_vcpus(&self, uuid: &str) -> Result<u32>;

    /// Change the number of virtual CPUs.
    async fn set_vcpus(&self, uuid: &str, count: u32) -> Result<()>;

    // =========================================================================
    // Network
    // =========================================================================

    /// Traffic counters for one interface, addressed by its host-side device.
    async fn interface_stats(&self, uuid: &str, device: &str) -> Result<InterfaceStats>;

    // =========================================================================
    // Migration
    // =========================================================================

    /// Migrate the domain to the hypervisor at `uri`.
    ///
    /// `flags` is a combination of the `migrate` constants; `bandwidth_mbps`
    /// of zero means unlimited.
    async fn migrate_to_uri(
        &self,
        uuid: &str,
        uri: &str,
        flags: u32,
        bandwidth_mbps: u64,
    ) -> Result<()>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribe to the domain's lifecycle events.
    async fn open_events(&self, uuid: &str) -> Result<EventStream>;

    /// Deregister a subscription created by `open_events`. The corresponding
    /// stream ends.
    async fn close_events(&self, id: u64) -> Result<()>;
}
