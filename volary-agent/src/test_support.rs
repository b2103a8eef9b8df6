//! Shared fixtures for the agent test modules.

use std::sync::Arc;

use tempfile::TempDir;
use volary_bus::{Jid, MockBus, Request};
use volary_hypervisor::{DriverKind, InterfaceStats, MockDomain, MockDriver};

use crate::config::AgentConfig;
use crate::protocol::{NS_VM_CONTROL, NS_VM_DEFINITION};
use crate::supervisor::MockSupervisor;
use crate::vm::VirtualMachine;

pub(crate) const VM_UUID: &str = "5e031953-ddb6-4a0c-92d7-9e7ecfb6b461";
pub(crate) const VM_NAME: &str = "test-vm";
pub(crate) const VM_PASSWORD: &str = "s3cret";
pub(crate) const ADMIN: &str = "admin@bus.local";

pub(crate) struct Fixture {
    // keeps the on-disk databases alive for the test's duration
    pub _dir: TempDir,
    pub driver: Arc<MockDriver>,
    pub bus: Arc<MockBus>,
    pub supervisor: Arc<MockSupervisor>,
    pub vm: Arc<VirtualMachine>,
}

pub(crate) fn domain_xml() -> String {
    format!(
        "<domain type='kvm'>\
           <name>{}</name>\
           <uuid>{}</uuid>\
           <memory unit='KiB'>1048576</memory>\
           <devices>\
             <interface type='bridge'>\
               <target dev='vnet0'/>\
               <alias name='net0'/>\
             </interface>\
           </devices>\
         </domain>",
        VM_NAME, VM_UUID
    )
}

pub(crate) fn sample_domain() -> MockDomain {
    MockDomain::new(domain_xml()).with_interface(
        "vnet0",
        InterfaceStats {
            rx_bytes: 1024,
            rx_packets: 8,
            tx_bytes: 2048,
            tx_packets: 16,
            ..Default::default()
        },
    )
}

pub(crate) fn test_config(dir: &TempDir) -> AgentConfig {
    AgentConfig {
        vm_base_path: dir.path().to_path_buf(),
        maximum_lock_time_secs: 30,
        root_admin: ADMIN.to_string(),
        ..AgentConfig::default()
    }
}

/// Build an authenticated agent over a mock stack.
///
/// With `with_domain` the driver already knows the domain (shut off); the
/// authenticated sequence then attaches to it.
pub(crate) async fn fixture(kind: DriverKind, with_domain: bool) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let driver = Arc::new(MockDriver::new(kind));
    if with_domain {
        driver.add_domain(VM_UUID, sample_domain());
    }
    let bus = Arc::new(MockBus::new());
    let supervisor = Arc::new(MockSupervisor::new(
        "hypervisor@bus.local".parse().unwrap(),
    ));

    let jid: Jid = format!("{}@bus.local", VM_UUID).parse().unwrap();
    let vm = VirtualMachine::new(
        jid,
        VM_PASSWORD,
        VM_NAME,
        driver.clone(),
        supervisor.clone(),
        bus.clone(),
        test_config(&dir),
    )
    .expect("agent construction");

    vm.authenticated().await;

    Fixture {
        _dir: dir,
        driver,
        bus,
        supervisor,
        vm,
    }
}

pub(crate) fn control(action: &str) -> Request {
    Request::new(ADMIN.parse().unwrap(), NS_VM_CONTROL, action)
}

pub(crate) fn definition(action: &str) -> Request {
    Request::new(ADMIN.parse().unwrap(), NS_VM_DEFINITION, action)
}

/// Give spawned tasks a chance to run.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
