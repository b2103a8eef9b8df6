//! Action handlers for the control and definition namespaces.
//!
//! The domain verbs assume the lock gate was taken by the router for
//! lock-acquiring actions; a verb releases it itself only on failure, the
//! confirming lifecycle event (real or synthesized) releases it on success.

use std::time::Duration;

use tracing::{debug, info, warn};
use volary_bus::{InfoPayload, NetworkPayload, Reply, ReplyPayload, Request, WireError};
use volary_hypervisor::{
    DomainEvent, DomainXml, DriverError, ResumedDetail, StartedDetail, StoppedDetail,
    SuspendedDetail,
};

use crate::error::AgentError;
use crate::protocol::*;
use crate::vm::VirtualMachine;

/// How many times the memory poll re-reads the applied value.
const MEMORY_POLL_RETRIES: u32 = 3;
/// Delay between memory poll reads.
const MEMORY_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Lower bound for a memory request, in KiB.
const MEMORY_FLOOR_KIB: u64 = 10;

fn driver_error_reply(request: &Request, e: &DriverError) -> Reply {
    Reply::error(
        request,
        WireError::new(e.code(), e.to_string()).with_ns(NS_DRIVER_ERROR),
    )
}

impl VirtualMachine {
    /// Translate a failed mutating verb: release the gate, then surface the
    /// driver's code verbatim or the action-specific code.
    fn mutating_failure(&self, request: &Request, code: i32, err: AgentError) -> Reply {
        self.lock.unlock();
        match err {
            AgentError::Driver(e) => driver_error_reply(request, &e),
            other => Reply::error(request, WireError::new(code, other.to_string())),
        }
    }

    fn plain_failure(request: &Request, code: i32, err: AgentError) -> Reply {
        match err {
            AgentError::Driver(e) => driver_error_reply(request, &e),
            other => Reply::error(request, WireError::new(code, other.to_string())),
        }
    }

    // =========================================================================
    // Domain verbs
    // =========================================================================

    /// Start the domain. Returns the hypervisor-assigned id.
    pub(crate) async fn create(&self) -> Result<i32, AgentError> {
        let uuid = self.uuid_string();
        self.driver.create(&uuid).await?;
        info!("virtual machine created");
        if !self.driver.kind().reports_lifecycle_events() {
            self.on_domain_event(DomainEvent::Started(StartedDetail::Booted))
                .await;
        }
        Ok(self.driver.domain_id(&uuid).await?)
    }

    /// Request a graceful shutdown.
    pub(crate) async fn shutdown_domain(&self) -> Result<(), AgentError> {
        let uuid = self.uuid_string();
        self.driver.shutdown(&uuid).await?;
        if let Ok(info) = self.driver.domain_info(&uuid).await {
            // the guest is still up while it powers down
            if info.state.is_active() {
                self.change_status_keep_show(STATUS_SHUTDOWNING).await;
            }
        }
        if !self.driver.kind().reports_lifecycle_events() {
            self.on_domain_event(DomainEvent::Stopped(StoppedDetail::Shutdown))
                .await;
        }
        info!("virtual machine shutdowned");
        Ok(())
    }

    /// Immediately terminate the domain.
    pub(crate) async fn destroy_domain(&self) -> Result<(), AgentError> {
        self.driver.destroy(&self.uuid_string()).await?;
        if !self.driver.kind().reports_lifecycle_events() {
            self.on_domain_event(DomainEvent::Stopped(StoppedDetail::Destroyed))
                .await;
        }
        info!("virtual machine destroyed");
        Ok(())
    }

    /// Ask the guest to reboot. Reboots happen in-guest: no lifecycle event
    /// confirms them and presence does not change; the lock safety timer is
    /// the release path.
    pub(crate) async fn reboot_domain(&self) -> Result<(), AgentError> {
        self.driver.reboot(&self.uuid_string()).await?;
        info!("virtual machine rebooted");
        Ok(())
    }

    pub(crate) async fn suspend_domain(&self) -> Result<(), AgentError> {
        self.driver.suspend(&self.uuid_string()).await?;
        info!("virtual machine suspended");
        if !self.driver.kind().reports_pause_events() {
            self.on_domain_event(DomainEvent::Suspended(SuspendedDetail::Paused))
                .await;
        }
        Ok(())
    }

    pub(crate) async fn resume_domain(&self) -> Result<(), AgentError> {
        self.driver.resume(&self.uuid_string()).await?;
        info!("virtual machine resumed");
        if !self.driver.kind().reports_pause_events() {
            self.on_domain_event(DomainEvent::Resumed(ResumedDetail::Unpaused))
                .await;
        }
        Ok(())
    }

    /// Define the domain from `xml`.
    ///
    /// The document's UUID must equal this agent's UUID. Its description is
    /// rewritten to carry the bus credentials and its name is forced to the
    /// display name before it reaches the driver.
    pub(crate) async fn define(&self, xml: &str) -> Result<(), AgentError> {
        let document = DomainXml::new(xml);
        let expected = self.uuid_string();
        let given = document
            .uuid()?
            .ok_or_else(|| AgentError::IncorrectUuid {
                given: "<missing>".to_string(),
                expected: expected.clone(),
            })?;
        if given != expected {
            return Err(AgentError::IncorrectUuid { given, expected });
        }

        let description = format!(
            "{}::::{}",
            self.jid().bare(),
            self.identity().password
        );
        let rewritten = document.with_identity(self.name(), &description)?;
        debug!(xml = %rewritten, "generated domain description");

        self.driver.define_xml(&rewritten).await?;
        if !self.domain_attached().await {
            if let Err(e) = self.connect_domain().await {
                warn!(error = %e, "cannot connect freshly defined domain");
            }
        }
        {
            self.inner.lock().await.definition = Some(rewritten);
        }
        if !self.driver.kind().reports_lifecycle_events() {
            self.on_domain_event(DomainEvent::Defined).await;
        }
        info!("virtual machine XML is defined");
        Ok(())
    }

    /// Undefine the domain. A no-op success when nothing is defined.
    pub(crate) async fn undefine_domain(&self) -> Result<(), AgentError> {
        if !self.domain_attached().await {
            warn!("virtual machine is already undefined");
            return Ok(());
        }
        self.driver.undefine(&self.uuid_string()).await?;
        if !self.driver.kind().reports_lifecycle_events() {
            self.on_domain_event(DomainEvent::Undefined).await;
        }
        info!("virtual machine undefined");
        Ok(())
    }

    /// The domain document with credentials stripped.
    pub(crate) async fn xmldesc(&self) -> Result<String, AgentError> {
        let raw = self.driver.xml_desc(&self.uuid_string(), true).await?;
        Ok(DomainXml::new(raw).without_description()?)
    }

    /// Runtime counters plus autostart and the owning hypervisor address.
    pub(crate) async fn info(&self) -> Result<InfoPayload, AgentError> {
        let uuid = self.uuid_string();
        let info = self.driver.domain_info(&uuid).await?;
        // autostart is best-effort; some drivers cannot report it
        let autostart = self.driver.autostart(&uuid).await.unwrap_or(false);
        Ok(InfoPayload {
            state: info.state.code(),
            max_mem: info.max_mem_kib,
            memory: info.memory_kib,
            nr_virt_cpu: info.nr_virt_cpu,
            cpu_time: info.cpu_time_ns,
            hypervisor_jid: self.supervisor.jid().to_string(),
            autostart: autostart as u8,
        })
    }

    /// Change the memory allocation and start the applied-value poll.
    pub(crate) async fn set_memory(&self, value: i64) -> Result<(), AgentError> {
        let requested = (value.max(MEMORY_FLOOR_KIB as i64)) as u64;
        self.driver.set_memory(&self.uuid_string(), requested).await?;
        self.spawn_memory_poll(requested);
        Ok(())
    }

    /// Bounded-retry poll: emit the "memory" change once the driver reports
    /// the requested value (or an undershoot), unconditionally after the
    /// retries run out.
    fn spawn_memory_poll(&self, requested: u64) {
        let vm = self.arc();
        tokio::spawn(async move {
            let mut remaining = MEMORY_POLL_RETRIES;
            loop {
                tokio::time::sleep(MEMORY_POLL_INTERVAL).await;
                let settled = match vm.driver.domain_info(&vm.uuid_string()).await {
                    Ok(info) if info.memory_kib > 0 => {
                        matches!(requested / info.memory_kib, 0 | 1)
                    }
                    _ => false,
                };
                remaining -= 1;
                if settled || remaining == 0 {
                    vm.push_change(CHANNEL_CONTROL, "memory").await;
                    return;
                }
            }
        });
    }

    /// Change the vCPU count; bounded by the driver's maximum. Releases the
    /// gate itself on success, the caller releases on failure.
    pub(crate) async fn set_vcpus(&self, value: u32) -> Result<(), AgentError> {
        let uuid = self.uuid_string();
        let max = self.driver.max_vcpus(&uuid).await?;
        if value > max {
            return Err(AgentError::VcpusExceeded(max));
        }
        self.driver.set_vcpus(&uuid, value).await?;
        self.lock.unlock();
        Ok(())
    }

    pub(crate) async fn set_autostart(&self, flag: bool) -> Result<(), AgentError> {
        self.driver.set_autostart(&self.uuid_string(), flag).await?;
        Ok(())
    }

    /// Per-interface traffic counters, keyed by alias name.
    pub(crate) async fn network_info(&self) -> Result<Vec<(String, NetworkPayload)>, AgentError> {
        let uuid = self.uuid_string();
        let document = DomainXml::new(self.driver.xml_desc(&uuid, false).await?);
        let mut result = Vec::new();
        for interface in document.interfaces()? {
            let (Some(alias), Some(device)) = (interface.alias, interface.target_dev) else {
                return Err(AgentError::Other(
                    "interface device without alias or target".to_string(),
                ));
            };
            let stats = self.driver.interface_stats(&uuid, &device).await?;
            result.push((
                alias,
                NetworkPayload {
                    rx_bytes: stats.rx_bytes,
                    rx_packets: stats.rx_packets,
                    rx_errs: stats.rx_errs,
                    rx_drop: stats.rx_drop,
                    tx_bytes: stats.tx_bytes,
                    tx_packets: stats.tx_packets,
                    tx_errs: stats.tx_errs,
                    tx_drop: stats.tx_drop,
                },
            ));
        }
        Ok(result)
    }

    // =========================================================================
    // Control namespace handlers
    // =========================================================================

    pub(crate) async fn iq_info(&self, request: &Request) -> Reply {
        if !self.domain_attached().await {
            return Reply::ignore(request);
        }
        match self.info().await {
            Ok(payload) => Reply::result(request, ReplyPayload::Info(payload)),
            Err(AgentError::Driver(e)) if e.is_no_domain() => {
                Reply::result(request, ReplyPayload::None)
            }
            Err(e) => Self::plain_failure(request, codes::VM_INFO, e),
        }
    }

    pub(crate) async fn iq_create(&self, request: &Request) -> Reply {
        match self.create().await {
            Ok(id) => Reply::result(request, ReplyPayload::Domain { id }),
            Err(e) => self.mutating_failure(request, codes::VM_CREATE, e),
        }
    }

    pub(crate) async fn iq_shutdown(&self, request: &Request) -> Reply {
        match self.shutdown_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => self.mutating_failure(request, codes::VM_SHUTDOWN, e),
        }
    }

    pub(crate) async fn iq_destroy(&self, request: &Request) -> Reply {
        match self.destroy_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => self.mutating_failure(request, codes::VM_DESTROY, e),
        }
    }

    pub(crate) async fn iq_reboot(&self, request: &Request) -> Reply {
        match self.reboot_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => self.mutating_failure(request, codes::VM_REBOOT, e),
        }
    }

    pub(crate) async fn iq_suspend(&self, request: &Request) -> Reply {
        match self.suspend_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => self.mutating_failure(request, codes::VM_SUSPEND, e),
        }
    }

    pub(crate) async fn iq_resume(&self, request: &Request) -> Reply {
        match self.resume_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => self.mutating_failure(request, codes::VM_RESUME, e),
        }
    }

    pub(crate) async fn iq_xmldesc(&self, request: &Request) -> Reply {
        if !self.domain_attached().await {
            return Reply::error(
                request,
                WireError::new(codes::VM_XMLDESC, AgentError::NotDefined.to_string()),
            );
        }
        match self.xmldesc().await {
            Ok(document) => Reply::result(request, ReplyPayload::Xml { document }),
            Err(e) => Self::plain_failure(request, codes::VM_XMLDESC, e),
        }
    }

    pub(crate) async fn iq_autostart(&self, request: &Request) -> Reply {
        let Some(value) = request.value else {
            return Reply::error(
                request,
                WireError::new(
                    codes::VM_AUTOSTART,
                    AgentError::MissingArgument("value").to_string(),
                ),
            );
        };
        match self.set_autostart(value != 0).await {
            Ok(()) => {
                info!(autostart = value, "virtual machine autostart is set");
                Reply::result(request, ReplyPayload::None)
            }
            Err(e) => Self::plain_failure(request, codes::VM_AUTOSTART, e),
        }
    }

    pub(crate) async fn iq_memory(&self, request: &Request) -> Reply {
        let Some(value) = request.value else {
            return Reply::error(
                request,
                WireError::new(
                    codes::VM_MEMORY,
                    AgentError::MissingArgument("value").to_string(),
                ),
            );
        };
        match self.set_memory(value).await {
            Ok(()) => {
                info!(memory_kib = value, "virtual machine memory is set");
                Reply::result(request, ReplyPayload::None)
            }
            Err(e) => Self::plain_failure(request, codes::VM_MEMORY, e),
        }
    }

    pub(crate) async fn iq_setvcpus(&self, request: &Request) -> Reply {
        let Some(value) = request.value else {
            return self.mutating_failure(
                request,
                codes::VM_MEMORY,
                AgentError::MissingArgument("value"),
            );
        };
        match self.set_vcpus(value.max(0) as u32).await {
            Ok(()) => {
                info!(vcpus = value, "virtual machine vcpu count is set");
                self.push_change(CHANNEL_CONTROL, "nvcpu").await;
                self.push_change(CHANNEL_DEFINITION, "nvcpu").await;
                Reply::result(request, ReplyPayload::None)
            }
            // setvcpus failures have always surfaced under the memory code
            Err(e) => self.mutating_failure(request, codes::VM_MEMORY, e),
        }
    }

    pub(crate) async fn iq_networkinfo(&self, request: &Request) -> Reply {
        if !self.domain_attached().await {
            return Reply::ignore(request);
        }
        match self.network_info().await {
            Ok(interfaces) => Reply::result(request, ReplyPayload::Networks { interfaces }),
            Err(AgentError::Driver(e)) if e.is_no_domain() => {
                Reply::result(request, ReplyPayload::None)
            }
            Err(e) => Self::plain_failure(request, codes::VM_NETWORKINFO, e),
        }
    }

    pub(crate) async fn iq_free(&self, request: &Request) -> Reply {
        info!("virtual machine will be freed now");
        match self.free().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => Self::plain_failure(request, codes::VM_FREE, e),
        }
    }

    // =========================================================================
    // Definition namespace handlers
    // =========================================================================

    pub(crate) async fn iq_define(&self, request: &Request) -> Reply {
        let Some(xml) = request.domain_xml.as_deref() else {
            return Reply::error(
                request,
                WireError::new(
                    codes::VM_DEFINE,
                    AgentError::MissingArgument("domain").to_string(),
                ),
            );
        };
        match self.define(xml).await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => Self::plain_failure(request, codes::VM_DEFINE, e),
        }
    }

    pub(crate) async fn iq_undefine(&self, request: &Request) -> Reply {
        match self.undefine_domain().await {
            Ok(()) => Reply::result(request, ReplyPayload::None),
            Err(e) => Self::plain_failure(request, codes::VM_UNDEFINE, e),
        }
    }

    pub(crate) async fn iq_capabilities(&self, request: &Request) -> Reply {
        Reply::result(
            request,
            ReplyPayload::Capabilities {
                document: self.supervisor.capabilities().to_string(),
            },
        )
    }
}
