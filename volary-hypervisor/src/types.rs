//! Type definitions for domain state, info and lifecycle events.

use serde::{Deserialize, Serialize};

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Runtime state of a domain as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainState {
    /// No state reported.
    NoState,
    /// The domain is running.
    Running,
    /// The domain is running but blocked on a resource.
    Blocked,
    /// Execution is frozen.
    Paused,
    /// A shutdown is in progress.
    Shutdown,
    /// The domain is shut off.
    ShutOff,
    /// The domain has crashed.
    Crashed,
}

impl DomainState {
    /// Numeric state code, matching the driver's native numbering.
    pub fn code(&self) -> u8 {
        match self {
            DomainState::NoState => 0,
            DomainState::Running => 1,
            DomainState::Blocked => 2,
            DomainState::Paused => 3,
            DomainState::Shutdown => 4,
            DomainState::ShutOff => 5,
            DomainState::Crashed => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "no-state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::ShutOff => "shut-off",
            DomainState::Crashed => "crashed",
        }
    }

    /// True when the guest is executing (running or blocked).
    pub fn is_active(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Blocked)
    }
}

impl Default for DomainState {
    fn default() -> Self {
        Self::ShutOff
    }
}

/// Snapshot of a domain's runtime counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Current power state
    pub state: DomainState,
    /// Maximum memory in KiB
    pub max_mem_kib: u64,
    /// Current memory in KiB
    pub memory_kib: u64,
    /// Number of virtual CPUs
    pub nr_virt_cpu: u32,
    /// Total CPU time consumed (nanoseconds)
    pub cpu_time_ns: u64,
}

/// Per-interface traffic counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

// =============================================================================
// DRIVER KIND
// =============================================================================

/// The family of hypervisor a driver talks to.
///
/// The kind decides which lifecycle events the driver delivers on its own;
/// for the rest the agent synthesizes the event after a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Qemu,
    Xen,
    Lxc,
    /// In-memory test driver; never delivers events on its own.
    Test,
}

impl DriverKind {
    /// Whether start/stop/define lifecycle events are delivered by the driver.
    pub fn reports_lifecycle_events(&self) -> bool {
        matches!(self, DriverKind::Qemu | DriverKind::Xen)
    }

    /// Whether suspend/resume events are delivered by the driver.
    pub fn reports_pause_events(&self) -> bool {
        matches!(self, DriverKind::Qemu)
    }

    /// Whether live migration is available on this driver family.
    pub fn supports_live_migration(&self) -> bool {
        matches!(self, DriverKind::Qemu)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Qemu => "qemu",
            DriverKind::Xen => "xen",
            DriverKind::Lxc => "lxc",
            DriverKind::Test => "test",
        }
    }
}

// =============================================================================
// LIFECYCLE EVENTS
// =============================================================================

/// Detail attached to a started event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartedDetail {
    Booted,
    Restored,
    /// Start caused by an incoming migration handshake.
    Migrated,
}

/// Detail attached to a suspended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuspendedDetail {
    Paused,
    Migrated,
}

/// Detail attached to a resumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumedDetail {
    Unpaused,
    Migrated,
}

/// Detail attached to a stopped event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoppedDetail {
    Shutdown,
    Destroyed,
    Failed,
    Migrated,
}

/// Asynchronous domain lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "event", content = "detail")]
pub enum DomainEvent {
    Started(StartedDetail),
    Suspended(SuspendedDetail),
    Resumed(ResumedDetail),
    Stopped(StoppedDetail),
    Crashed,
    Shutoff,
    Defined,
    Undefined,
}

impl DomainEvent {
    /// True when the event is an artifact of a migration handshake and must
    /// not be reflected in presence or hooks.
    pub fn is_migration_artifact(&self) -> bool {
        matches!(
            self,
            DomainEvent::Started(StartedDetail::Migrated)
                | DomainEvent::Suspended(SuspendedDetail::Migrated)
                | DomainEvent::Resumed(ResumedDetail::Migrated)
                | DomainEvent::Stopped(StoppedDetail::Migrated)
        )
    }

    /// True for the two events after which no domain info is reachable.
    pub fn is_definition_event(&self) -> bool {
        matches!(self, DomainEvent::Defined | DomainEvent::Undefined)
    }
}

/// Migration flags, combined bitwise.
pub mod migrate {
    /// Keep the guest running during the transfer.
    pub const LIVE: u32 = 1 << 0;
    /// Direct source-to-destination connection.
    pub const PEER_TO_PEER: u32 = 1 << 1;
    /// Persist the definition on the destination host.
    pub const PERSIST_DEST: u32 = 1 << 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_match_native_numbering() {
        assert_eq!(DomainState::NoState.code(), 0);
        assert_eq!(DomainState::Running.code(), 1);
        assert_eq!(DomainState::ShutOff.code(), 5);
        assert_eq!(DomainState::Crashed.code(), 6);
    }

    #[test]
    fn active_states() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Blocked.is_active());
        assert!(!DomainState::Paused.is_active());
        assert!(!DomainState::ShutOff.is_active());
    }

    #[test]
    fn migration_artifacts_are_detected() {
        assert!(DomainEvent::Started(StartedDetail::Migrated).is_migration_artifact());
        assert!(DomainEvent::Stopped(StoppedDetail::Migrated).is_migration_artifact());
        assert!(!DomainEvent::Started(StartedDetail::Booted).is_migration_artifact());
        assert!(!DomainEvent::Crashed.is_migration_artifact());
    }

    #[test]
    fn definition_events() {
        assert!(DomainEvent::Defined.is_definition_event());
        assert!(DomainEvent::Undefined.is_definition_event());
        assert!(!DomainEvent::Shutoff.is_definition_event());
    }
}
