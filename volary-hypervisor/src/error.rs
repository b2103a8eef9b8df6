//! Error types for the hypervisor driver boundary.

use thiserror::Error;

/// Errors reported by a hypervisor driver.
///
/// Every variant carries a stable numeric code so that callers can surface
/// the driver's native error code over the wire unchanged.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Failed to connect to the hypervisor.
    #[error("failed to connect to hypervisor driver: {0}")]
    ConnectionFailed(String),

    /// No domain with a matching identifier exists.
    #[error("no domain with matching uuid: {0}")]
    NoDomain(String),

    /// The operation is not valid in the domain's current state.
    #[error("operation invalid for current domain state: {0}")]
    OperationInvalid(String),

    /// The driver attempted the operation and it failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The driver does not support the operation.
    #[error("operation not supported by this driver: {0}")]
    Unsupported(String),

    /// The operation did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The domain XML could not be parsed or generated.
    #[error("domain XML error: {0}")]
    Xml(String),

    /// Internal driver error.
    #[error("internal driver error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Stable numeric code for this error, suitable for wire replies.
    pub fn code(&self) -> i32 {
        match self {
            DriverError::Internal(_) => 1,
            DriverError::Unsupported(_) => 3,
            DriverError::OperationFailed(_) => 9,
            DriverError::Xml(_) => 27,
            DriverError::ConnectionFailed(_) => 38,
            DriverError::NoDomain(_) => 42,
            DriverError::OperationInvalid(_) => 55,
            DriverError::Timeout(_) => 68,
        }
    }

    /// True when the error means the domain simply does not exist.
    pub fn is_no_domain(&self) -> bool {
        matches!(self, DriverError::NoDomain(_))
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
