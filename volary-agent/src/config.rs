//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration handed to each agent by the hypervisor supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base directory under which each VM gets its own folder.
    pub vm_base_path: PathBuf,
    /// Safety timeout after which a held lock is force-released, in seconds.
    pub maximum_lock_time_secs: u64,
    /// Filename of the per-VM permission database, relative to the VM folder.
    pub permissions_database_file: String,
    /// Bus address whose permission checks always pass.
    pub root_admin: String,
    /// Path to the default avatar published with the vCard.
    pub default_avatar: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            vm_base_path: PathBuf::from("/var/lib/volary/vms"),
            maximum_lock_time_secs: 30,
            permissions_database_file: "permissions.sqlite3".to_string(),
            root_admin: "admin@localhost".to_string(),
            default_avatar: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).with_context(|| "failed to parse config file")?;

        Ok(config)
    }

    /// The lock safety timeout as a duration.
    pub fn maximum_lock_time(&self) -> Duration {
        Duration::from_secs(self.maximum_lock_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.maximum_lock_time(), Duration::from_secs(30));
        assert_eq!(config.permissions_database_file, "permissions.sqlite3");
    }

    #[test]
    fn parses_partial_yaml() {
        let config: AgentConfig = serde_yaml::from_str(
            "vm_base_path: /tmp/vms\nmaximum_lock_time_secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.vm_base_path, PathBuf::from("/tmp/vms"));
        assert_eq!(config.maximum_lock_time_secs, 5);
        // untouched fields keep their defaults
        assert_eq!(config.root_admin, "admin@localhost");
    }
}
