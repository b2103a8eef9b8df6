//! # Volary Hypervisor
//!
//! Hypervisor driver boundary for the per-VM control agent.
//!
//! This crate defines the `Driver` trait the agent programs against, the
//! domain state and lifecycle-event types, helpers for inspecting and
//! rewriting domain XML documents, and an in-memory `MockDriver` backend.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Driver Trait                │
//! │ (create, shutdown, define, events, ...) │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  system binding   │     │    MockDriver     │
//! │  (out of tree)    │     │   (in-memory)     │
//! └───────────────────┘     └───────────────────┘
//! ```

pub mod error;
pub mod mock;
pub mod traits;
pub mod types;
pub mod xml;

pub use error::{DriverError, Result};
pub use mock::{MockDomain, MockDriver};
pub use traits::{Driver, EventStream};
pub use types::{
    migrate, DomainEvent, DomainInfo, DomainState, DriverKind, InterfaceStats, ResumedDetail,
    StartedDetail, StoppedDetail, SuspendedDetail,
};
pub use xml::{DomainXml, InterfaceRef};
