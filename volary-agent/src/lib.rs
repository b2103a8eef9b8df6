//! # Volary Agent
//!
//! The per-VM control agent. One agent instance supervises one virtual
//! machine: it holds a long-lived session on the messaging bus under the
//! VM's UUID, reflects the hypervisor's view of the domain as bus presence,
//! serves typed control and definition requests under a permission model,
//! and propagates domain lifecycle events back to subscribers as change
//! notifications and hook invocations.
//!
//! ## Architecture
//!
//! ```text
//!  bus requests ──► Request Router ──► Action Handlers ──► Driver
//!                      │    │                                 │
//!               Permission  Lock Gate                lifecycle events
//!                  Center       ▲                             │
//!                               └───────── Event Ingress ◄────┘
//!                                            │
//!                        presence + change notifications + hooks
//! ```
//!
//! The agent is created by the hypervisor supervisor; the bus client and the
//! hypervisor driver are injected as trait objects.

pub mod actions;
pub mod cloning;
pub mod config;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod migration;
pub mod permissions;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod supervisor;
pub mod triggers;
pub mod vm;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod test_support;

pub use cloning::CloneSource;
pub use config::AgentConfig;
pub use error::AgentError;
pub use hooks::{Hook, HookBus, HookEvent};
pub use lock::LockGate;
pub use permissions::PermissionCenter;
pub use supervisor::{MockSupervisor, Supervisor};
pub use triggers::{Trigger, TriggerMode, TriggerStore, Watcher, WatcherAction};
pub use vm::{VmIdentity, VirtualMachine};
