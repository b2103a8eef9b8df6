//! Live-migration coordinator.
//!
//! Three steps: validate preconditions and raise the migration flag, ask the
//! target hypervisor for its driver URI, then run the transfer in a
//! background task. The domain is never undefined locally on success; the
//! supervisor unregisters the agent once the transfer completes.

use std::sync::Arc;

use tracing::{error, info};
use volary_bus::{Jid, Reply, Request, WireError};
use volary_hypervisor::migrate;

use crate::error::AgentError;
use crate::protocol::*;
use crate::vm::VirtualMachine;

impl VirtualMachine {
    /// Steps 1 and 2: validate, raise `is_migrating`, fetch the peer URI and
    /// kick off the background transfer.
    pub(crate) async fn migrate(&self, target: &Jid) -> Result<(), AgentError> {
        if !self.driver.kind().supports_live_migration() {
            return Err(AgentError::MigrationRefused(
                "live migration is only supported for QEMU-class domains".to_string(),
            ));
        }
        {
            let inner = self.inner.lock().await;
            if inner.is_migrating {
                return Err(AgentError::MigrationRefused(
                    "virtual machine is already migrating".to_string(),
                ));
            }
            if inner.definition.is_none() {
                return Err(AgentError::MigrationRefused(
                    "virtual machine must be defined".to_string(),
                ));
            }
        }
        let info = self.driver.domain_info(&self.uuid_string()).await?;
        if !info.state.is_active() {
            return Err(AgentError::MigrationRefused(
                "virtual machine must be running".to_string(),
            ));
        }
        if self.supervisor.jid().bare() == target.bare() {
            return Err(AgentError::MigrationRefused(format!(
                "virtual machine is already running on {}",
                target.bare()
            )));
        }

        {
            self.inner.lock().await.is_migrating = true;
        }
        info!(target = %target, "migration accepted, querying peer driver uri");

        // step 2: the peer supervisor tells us where to send the domain
        let uri = match self
            .bus
            .iq_get(target, NS_HYPERVISOR_CONTROL, "uri")
            .await
        {
            Ok(response) => match response.value("uri") {
                Some(uri) => uri.to_string(),
                None => {
                    self.inner.lock().await.is_migrating = false;
                    return Err(AgentError::MigrationRefused(
                        "peer reply carried no driver uri".to_string(),
                    ));
                }
            },
            Err(e) => {
                self.inner.lock().await.is_migrating = false;
                return Err(e.into());
            }
        };

        self.change_status_keep_show(STATUS_MIGRATING).await;

        let vm = self.arc();
        tokio::spawn(async move {
            vm.migrate_transfer(uri).await;
        });
        Ok(())
    }

    /// Step 3: the transfer itself. On failure the flag is cleared, presence
    /// says so and the group chat gets a diagnostic; on success the flag
    /// stays up until the supervisor terminates this agent.
    async fn migrate_transfer(self: Arc<Self>, uri: String) {
        let flags = migrate::PEER_TO_PEER | migrate::PERSIST_DEST | migrate::LIVE;
        match self
            .driver
            .migrate_to_uri(&self.uuid_string(), &uri, flags, 0)
            .await
        {
            Ok(()) => {
                info!(target = %uri, "migration transfer finished");
            }
            Err(e) => {
                error!(target = %uri, error = %e, "cannot migrate");
                {
                    self.inner.lock().await.is_migrating = false;
                }
                self.change_status_keep_show(STATUS_CANT_MIGRATE).await;
                let body = format!("I cannot migrate to {} because: {}", uri, e);
                if let Err(send_err) = self.bus.group_message("migration", &body).await {
                    error!(error = %send_err, "cannot broadcast migration diagnostic");
                }
            }
        }
    }

    pub(crate) async fn iq_migrate(&self, request: &Request) -> Reply {
        let parsed = request
            .hypervisor_jid
            .as_deref()
            .ok_or(AgentError::MissingArgument("hypervisorjid"))
            .and_then(|raw| raw.parse::<Jid>().map_err(AgentError::from));
        let target = match parsed {
            Ok(target) => target,
            Err(e) => {
                return Reply::error(request, WireError::new(codes::VM_MIGRATE, e.to_string()))
            }
        };
        match self.migrate(&target).await {
            Ok(()) => Reply::result(request, volary_bus::ReplyPayload::None),
            Err(e) => Reply::error(request, WireError::new(codes::VM_MIGRATE, e.to_string())),
        }
    }
}
