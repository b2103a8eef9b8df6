//! Run one agent over the in-memory mock stack.
//!
//! Development harness for poking at the request pipeline without a
//! hypervisor or a bus server:
//!
//! ```bash
//! cargo run --example dev_agent
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use volary_agent::{AgentConfig, MockSupervisor, VirtualMachine};
use volary_bus::{Jid, MockBus, Request};
use volary_hypervisor::{DriverKind, MockDomain, MockDriver};

const VM_UUID: &str = "5e031953-ddb6-4a0c-92d7-9e7ecfb6b461";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    volary_common::init_logging("debug")?;

    let config = AgentConfig {
        vm_base_path: std::env::temp_dir().join("volary-dev"),
        ..AgentConfig::default()
    };

    let driver = Arc::new(MockDriver::new(DriverKind::Test));
    driver.add_domain(
        VM_UUID,
        MockDomain::new(format!(
            "<domain type='kvm'><name>dev-vm</name><uuid>{}</uuid></domain>",
            VM_UUID
        )),
    );
    let bus = Arc::new(MockBus::new());
    let supervisor = Arc::new(MockSupervisor::new("hypervisor@bus.local".parse()?));

    let jid: Jid = format!("{}@bus.local", VM_UUID).parse()?;
    let vm = VirtualMachine::new(
        jid,
        "dev-password",
        "dev-vm",
        driver,
        supervisor,
        bus.clone(),
        config,
    )?;

    vm.authenticated().await;

    let (tx, rx) = mpsc::channel(16);
    let serve = tokio::spawn(vm.clone().serve(rx));

    // the default root admin passes every permission check
    let admin: Jid = "admin@localhost".parse()?;
    for action in ["info", "create", "info"] {
        tx.send(Request::new(admin.clone(), "archipel:vm:control", action))
            .await?;
    }
    drop(tx);
    serve.await?;

    for (to, reply) in bus.replies() {
        println!("reply to {}: {:?}", to, reply);
    }
    println!("final presence: {:?}", bus.last_presence());
    Ok(())
}
