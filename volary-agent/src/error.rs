//! Agent error type.

use thiserror::Error;
use volary_bus::BusError;
use volary_hypervisor::DriverError;

/// Errors raised while operating the agent.
///
/// Handlers translate these exactly once into typed wire errors; they never
/// escape into the router loop.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A hypervisor driver call failed; surfaced with the driver's code.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A trigger or permission database operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The bus address node part is not a UUID.
    #[error("bus address node part is not a valid uuid: {0}")]
    InvalidIdentity(String),

    /// A define request carried a document for a different VM.
    #[error("IncorrectUUID: given UUID {given} does not match {expected}")]
    IncorrectUuid { given: String, expected: String },

    /// The lock gate is held by another operation.
    #[error("virtual machine is locked")]
    Locked,

    /// The agent is migrating away.
    #[error("virtual machine is migrating")]
    Migrating,

    /// The domain has no definition.
    #[error("not-defined")]
    NotDefined,

    /// A migration precondition was not met.
    #[error("{0}")]
    MigrationRefused(String),

    /// The request is missing a required argument.
    #[error("missing request argument: {0}")]
    MissingArgument(&'static str),

    /// setvcpus beyond the driver's maximum.
    #[error("maximum vCPU count is {0}")]
    VcpusExceeded(u32),

    /// A database was used after `terminate` closed it.
    #[error("database is closed")]
    StoreClosed,

    /// Filesystem failure (folder creation, cloning).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}
