//! Request routing for the two served namespaces.
//!
//! Pipeline per request: resolve the action (unknown → ignore), check the
//! permission, check the driver connection, apply the migration guard, take
//! the lock gate for lock-acquiring actions, dispatch. Handlers translate
//! failures into typed errors themselves; nothing raised here ever escapes
//! into the serve loop.

use tracing::{debug, error, info};
use volary_bus::{Reply, Request, WireError};

use crate::protocol::*;
use crate::vm::VirtualMachine;

impl VirtualMachine {
    /// Route one inbound request. `None` means no reply is sent: unknown
    /// namespace or action, or no driver connection.
    pub async fn handle_request(&self, request: Request) -> Option<Reply> {
        match request.ns.as_str() {
            NS_VM_CONTROL => self.process_control(request).await,
            NS_VM_DEFINITION => self.process_definition(request).await,
            other => {
                debug!(ns = %other, "request on unhandled namespace, ignoring");
                None
            }
        }
    }

    async fn process_control(&self, request: Request) -> Option<Reply> {
        let Some(action) = ControlAction::from_name(&request.action) else {
            debug!(action = %request.action, "unknown control action, ignoring");
            return None;
        };

        if !self
            .permissions
            .check(&request.from.bare().to_string(), action.permission())
        {
            info!(from = %request.from, action = action.as_str(), "permission denied");
            return Some(Reply::error(
                &request,
                WireError::new(codes::PERMISSION_DENIED, "forbidden"),
            ));
        }

        if !self.driver_online().await {
            info!("control action required but no driver connection");
            return None;
        }

        if self.is_migrating().await && !action.allowed_while_migrating() {
            return Some(Reply::error(
                &request,
                WireError::new(
                    codes::VM_MIGRATING,
                    "virtual machine is migrating, cannot perform this control operation",
                ),
            ));
        }

        if action.requires_lock() && !self.lock.try_lock() {
            error!(action = action.as_str(), "virtual machine is locked, cannot do anything");
            return Some(Reply::error(
                &request,
                WireError::new(codes::VM_LOCKED, "virtual machine is locked, cannot do anything"),
            ));
        }

        Some(match action {
            ControlAction::Info => self.iq_info(&request).await,
            ControlAction::Create => self.iq_create(&request).await,
            ControlAction::Shutdown => self.iq_shutdown(&request).await,
            ControlAction::Destroy => self.iq_destroy(&request).await,
            ControlAction::Reboot => self.iq_reboot(&request).await,
            ControlAction::Suspend => self.iq_suspend(&request).await,
            ControlAction::Resume => self.iq_resume(&request).await,
            ControlAction::XmlDesc => self.iq_xmldesc(&request).await,
            ControlAction::Migrate => self.iq_migrate(&request).await,
            ControlAction::Autostart => self.iq_autostart(&request).await,
            ControlAction::Memory => self.iq_memory(&request).await,
            ControlAction::SetVcpus => self.iq_setvcpus(&request).await,
            ControlAction::NetworkInfo => self.iq_networkinfo(&request).await,
            ControlAction::Free => self.iq_free(&request).await,
        })
    }

    async fn process_definition(&self, request: Request) -> Option<Reply> {
        let Some(action) = DefinitionAction::from_name(&request.action) else {
            debug!(action = %request.action, "unknown definition action, ignoring");
            return None;
        };

        if !self
            .permissions
            .check(&request.from.bare().to_string(), action.permission())
        {
            info!(from = %request.from, action = action.as_str(), "permission denied");
            return Some(Reply::error(
                &request,
                WireError::new(codes::PERMISSION_DENIED, "forbidden"),
            ));
        }

        if self.is_migrating().await && !action.allowed_while_migrating() {
            return Some(Reply::error(
                &request,
                WireError::new(
                    codes::VM_MIGRATING,
                    "virtual machine is migrating, cannot perform this control operation",
                ),
            ));
        }

        Some(match action {
            DefinitionAction::Define => self.iq_define(&request).await,
            DefinitionAction::Undefine => self.iq_undefine(&request).await,
            DefinitionAction::Capabilities => self.iq_capabilities(&request).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use volary_bus::{Reply, ReplyPayload};
    use volary_hypervisor::{DomainState, DriverKind};

    use crate::protocol::codes;
    use crate::supervisor::Supervisor;
    use crate::test_support::*;

    #[tokio::test]
    async fn unknown_action_is_ignored() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f.vm.handle_request(control("setpincpus")).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn unknown_namespace_is_ignored() {
        let f = fixture(DriverKind::Qemu, true).await;
        let mut request = control("create");
        request.ns = "archipel:vm:snapshots".to_string();
        assert!(f.vm.handle_request(request).await.is_none());
    }

    #[tokio::test]
    async fn denied_subject_gets_a_typed_error() {
        let f = fixture(DriverKind::Qemu, true).await;
        let mut request = control("create");
        request.from = "stranger@bus.local".parse().unwrap();

        let reply = f.vm.handle_request(request).await.unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::PERMISSION_DENIED);
        // no driver call was made
        assert_eq!(
            f.driver
                .inspect_domain(VM_UUID, |d| d.state)
                .unwrap(),
            DomainState::ShutOff
        );
    }

    #[tokio::test]
    async fn granted_subject_passes() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.vm.permissions.grant("user@bus.local", "info").unwrap();

        let mut request = control("info");
        request.from = "user@bus.local".parse().unwrap();
        let reply = f.vm.handle_request(request).await.unwrap();
        assert!(matches!(
            reply,
            Reply::Result {
                payload: ReplyPayload::Info(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn second_mutating_request_is_rejected_while_locked() {
        let f = fixture(DriverKind::Qemu, true).await;

        // create succeeds and leaves the gate held until the event lands
        let reply = f.vm.handle_request(control("create")).await.unwrap();
        assert!(matches!(
            reply,
            Reply::Result {
                payload: ReplyPayload::Domain { .. },
                ..
            }
        ));
        assert!(f.vm.is_locked());

        let reply = f.vm.handle_request(control("shutdown")).await.unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_LOCKED);
        // the driver never saw the shutdown
        assert_eq!(
            f.driver.inspect_domain(VM_UUID, |d| d.state).unwrap(),
            DomainState::Running
        );
    }

    #[tokio::test]
    async fn read_only_actions_bypass_the_lock() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.vm.handle_request(control("create")).await.unwrap();
        assert!(f.vm.is_locked());

        let reply = f.vm.handle_request(control("info")).await.unwrap();
        assert!(matches!(
            reply,
            Reply::Result {
                payload: ReplyPayload::Info(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn migration_guard_rejects_mutations_but_serves_reads() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.vm.inner.lock().await.is_migrating = true;

        let reply = f.vm.handle_request(control("shutdown")).await.unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATING);

        let reply = f.vm.handle_request(control("info")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));

        // definition namespace: capabilities is exempt, define is not
        let reply = f.vm.handle_request(definition("capabilities")).await.unwrap();
        assert!(matches!(
            reply,
            Reply::Result {
                payload: ReplyPayload::Capabilities { .. },
                ..
            }
        ));
        let reply = f
            .vm
            .handle_request(definition("define").with_domain_xml(domain_xml()))
            .await
            .unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATING);
    }

    #[tokio::test]
    async fn define_with_foreign_uuid_is_refused() {
        let f = fixture(DriverKind::Qemu, false).await;
        let foreign =
            domain_xml().replace(VM_UUID, "11111111-2222-3333-4444-555555555555");

        let reply = f
            .vm
            .handle_request(definition("define").with_domain_xml(foreign))
            .await
            .unwrap();

        let error = reply.wire_error().unwrap();
        assert_eq!(error.code, codes::VM_DEFINE);
        assert!(error.text.contains("IncorrectUUID"));
        // the driver never defined anything
        assert!(f
            .driver
            .inspect_domain("11111111-2222-3333-4444-555555555555", |_| ())
            .is_none());
        assert!(f.vm.definition_xml().await.is_none());
    }

    #[tokio::test]
    async fn info_without_domain_is_an_ignore_reply() {
        let f = fixture(DriverKind::Qemu, false).await;
        let reply = f.vm.handle_request(control("info")).await.unwrap();
        assert!(matches!(reply, Reply::Ignore { .. }));
    }

    #[tokio::test]
    async fn xmldesc_without_domain_is_a_typed_error() {
        let f = fixture(DriverKind::Qemu, false).await;
        let reply = f.vm.handle_request(control("xmldesc")).await.unwrap();
        let error = reply.wire_error().unwrap();
        assert_eq!(error.code, codes::VM_XMLDESC);
        assert!(error.text.contains("not-defined"));
    }

    #[tokio::test]
    async fn undefine_on_null_domain_is_a_no_op_success() {
        let f = fixture(DriverKind::Qemu, false).await;
        let reply = f.vm.handle_request(definition("undefine")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
    }

    #[tokio::test]
    async fn driver_failure_releases_the_lock_and_carries_the_driver_code() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.driver.inject_failure(
            "create",
            volary_hypervisor::DriverError::OperationFailed("no space".into()),
        );

        let reply = f.vm.handle_request(control("create")).await.unwrap();
        let error = reply.wire_error().unwrap();
        assert_eq!(error.code, 9);
        assert_eq!(error.ns.as_deref(), Some("libvirt:error:generic"));
        assert!(!f.vm.is_locked());

        // the gate is free again: a retry goes through
        let reply = f.vm.handle_request(control("create")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
    }

    #[tokio::test]
    async fn setvcpus_beyond_maximum_is_refused_and_unlocks() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f
            .vm
            .handle_request(control("setvcpus").with_value(4096))
            .await
            .unwrap();
        assert!(reply.wire_error().is_some());
        assert!(!f.vm.is_locked());

        let reply = f
            .vm
            .handle_request(control("setvcpus").with_value(4))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert!(!f.vm.is_locked());
        assert_eq!(
            f.driver.inspect_domain(VM_UUID, |d| d.nr_virt_cpu).unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn autostart_is_forwarded() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f
            .vm
            .handle_request(control("autostart").with_value(1))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert!(f.driver.inspect_domain(VM_UUID, |d| d.autostart).unwrap());
    }

    #[tokio::test]
    async fn networkinfo_returns_counters_keyed_by_alias() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f.vm.handle_request(control("networkinfo")).await.unwrap();
        let Reply::Result {
            payload: ReplyPayload::Networks { interfaces },
            ..
        } = reply
        else {
            panic!("expected network payload, got {:?}", reply);
        };
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].0, "net0");
        assert_eq!(interfaces[0].1.rx_bytes, 1024);
        assert_eq!(interfaces[0].1.tx_packets, 16);
    }

    #[tokio::test]
    async fn free_fires_the_hook_and_delegates_to_the_supervisor() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f.vm.handle_request(control("free")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert_eq!(f.supervisor.freed(), vec![f.vm.jid().clone()]);
    }

    #[tokio::test]
    async fn capabilities_come_from_the_supervisor() {
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f.vm.handle_request(definition("capabilities")).await.unwrap();
        let Reply::Result {
            payload: ReplyPayload::Capabilities { document },
            ..
        } = reply
        else {
            panic!("expected capabilities payload");
        };
        assert_eq!(document, f.supervisor.capabilities());
    }
}
