//! Wire-level protocol constants and action names.
//!
//! Everything here is part of the stable external contract: namespaces,
//! error codes, presence status texts and the action vocabulary of the two
//! request namespaces.

/// Control request namespace.
pub const NS_VM_CONTROL: &str = "archipel:vm:control";
/// Definition request namespace.
pub const NS_VM_DEFINITION: &str = "archipel:vm:definition";
/// Namespace served by hypervisor supervisors, used to ask a migration
/// target for its driver URI.
pub const NS_HYPERVISOR_CONTROL: &str = "archipel:hypervisor:control";
/// Error namespace under which driver errors are surfaced verbatim.
pub const NS_DRIVER_ERROR: &str = "libvirt:error:generic";

/// Change-notification channel for runtime state.
pub const CHANNEL_CONTROL: &str = "virtualmachine:control";
/// Change-notification channel for definition state.
pub const CHANNEL_DEFINITION: &str = "virtualmachine:definition";

/// Name of the distinguished trigger reflecting the running state.
pub const TRIGGER_RUN: &str = "libvirt_run";

// Presence status texts.
pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_PAUSED: &str = "Paused";
pub const STATUS_SHUT_OFF: &str = "Shutted off";
pub const STATUS_SHUTDOWNING: &str = "Shutdowning...";
pub const STATUS_CRASHED: &str = "Crashed";
pub const STATUS_NOT_DEFINED: &str = "Not defined";
pub const STATUS_MIGRATING: &str = "Migrating...";
pub const STATUS_CANT_MIGRATE: &str = "Can't migrate.";
pub const STATUS_CLONING: &str = "Cloning...";

/// Stable error codes of the typed error replies.
pub mod codes {
    pub const VM_CREATE: i32 = -1001;
    pub const VM_SUSPEND: i32 = -1002;
    pub const VM_RESUME: i32 = -1003;
    pub const VM_DESTROY: i32 = -1004;
    pub const VM_SHUTDOWN: i32 = -1005;
    pub const VM_REBOOT: i32 = -1006;
    pub const VM_DEFINE: i32 = -1007;
    pub const VM_UNDEFINE: i32 = -1008;
    pub const VM_INFO: i32 = -1009;
    pub const VM_XMLDESC: i32 = -1011;
    pub const VM_LOCKED: i32 = -1012;
    pub const VM_MIGRATE: i32 = -1013;
    pub const VM_IS_MIGRATING: i32 = -1014;
    pub const VM_AUTOSTART: i32 = -1015;
    pub const VM_MEMORY: i32 = -1016;
    pub const VM_NETWORKINFO: i32 = -1017;
    pub const VM_HYPERVISOR_CAPABILITIES: i32 = -1019;
    pub const VM_FREE: i32 = -1020;
    pub const VM_MIGRATING: i32 = -43;
    /// Generic permission-denied sentinel.
    pub const PERMISSION_DENIED: i32 = -1;
}

/// Actions of the control namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Info,
    Create,
    Shutdown,
    Destroy,
    Reboot,
    Suspend,
    Resume,
    XmlDesc,
    Migrate,
    Autostart,
    Memory,
    SetVcpus,
    NetworkInfo,
    Free,
}

impl ControlAction {
    /// Resolve an envelope action name; unknown names are ignored upstream.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "info" => Self::Info,
            "create" => Self::Create,
            "shutdown" => Self::Shutdown,
            "destroy" => Self::Destroy,
            "reboot" => Self::Reboot,
            "suspend" => Self::Suspend,
            "resume" => Self::Resume,
            "xmldesc" => Self::XmlDesc,
            "migrate" => Self::Migrate,
            "autostart" => Self::Autostart,
            "memory" => Self::Memory,
            "setvcpus" => Self::SetVcpus,
            "networkinfo" => Self::NetworkInfo,
            "free" => Self::Free,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Create => "create",
            Self::Shutdown => "shutdown",
            Self::Destroy => "destroy",
            Self::Reboot => "reboot",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::XmlDesc => "xmldesc",
            Self::Migrate => "migrate",
            Self::Autostart => "autostart",
            Self::Memory => "memory",
            Self::SetVcpus => "setvcpus",
            Self::NetworkInfo => "networkinfo",
            Self::Free => "free",
        }
    }

    /// The permission guarding this action.
    pub fn permission(&self) -> &'static str {
        match self {
            Self::SetVcpus => "setvcpus",
            other => other.as_str(),
        }
    }

    /// Actions that take the lock gate before entering the driver.
    pub fn requires_lock(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::Shutdown
                | Self::Destroy
                | Self::Reboot
                | Self::Suspend
                | Self::Resume
                | Self::SetVcpus
        )
    }

    /// Read-only actions still served while a migration is in flight.
    pub fn allowed_while_migrating(&self) -> bool {
        matches!(self, Self::Info | Self::XmlDesc | Self::NetworkInfo)
    }
}

/// Actions of the definition namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionAction {
    Define,
    Undefine,
    Capabilities,
}

impl DefinitionAction {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "define" => Self::Define,
            "undefine" => Self::Undefine,
            "capabilities" => Self::Capabilities,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Define => "define",
            Self::Undefine => "undefine",
            Self::Capabilities => "capabilities",
        }
    }

    pub fn permission(&self) -> &'static str {
        self.as_str()
    }

    pub fn allowed_while_migrating(&self) -> bool {
        matches!(self, Self::Capabilities)
    }
}

/// The fixed permission set, created with deny-by-default on first start.
pub const PERMISSIONS: &[(&str, &str)] = &[
    ("info", "Access virtual machine information"),
    ("create", "Start the virtual machine"),
    ("shutdown", "Shut the virtual machine down"),
    ("destroy", "Destroy the virtual machine"),
    ("reboot", "Reboot the virtual machine"),
    ("suspend", "Suspend the virtual machine"),
    ("resume", "Resume the virtual machine"),
    ("xmldesc", "Access the XML description of the virtual machine"),
    ("migrate", "Perform live migration"),
    ("autostart", "Set the virtual machine autostart"),
    ("memory", "Change memory allocation live"),
    ("setvcpus", "Set the number of virtual CPUs live"),
    ("networkinfo", "Access the virtual machine's network statistics"),
    ("define", "Define the virtual machine"),
    ("undefine", "Undefine the virtual machine"),
    ("capabilities", "Access the hypervisor capabilities"),
    ("free", "Completely remove the virtual machine"),
];
