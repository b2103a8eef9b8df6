//! Background provisioning of this VM from a parent VM's folder.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};
use volary_bus::PresenceShow;

use crate::protocol::STATUS_CLONING;
use crate::vm::VirtualMachine;

/// What a clone needs from its parent.
#[derive(Debug, Clone)]
pub struct CloneSource {
    /// The parent's domain XML document.
    pub definition: String,
    /// Folder whose files are copied into this VM's folder.
    pub path: PathBuf,
    /// The parent's UUID, substituted with this agent's UUID.
    pub parent_uuid: String,
    /// The parent's name, substituted with this agent's name.
    pub parent_name: String,
}

impl VirtualMachine {
    /// Provision this VM as a clone of `source`.
    ///
    /// Rewrites the parent identity out of the definition, sets the cloning
    /// presence, and copies + defines in a background task. Failures are
    /// logged; there is no partial-failure rollback.
    pub async fn clone_from_parent(&self, source: CloneSource) {
        let xml = source
            .definition
            .replace(&source.parent_uuid, &self.uuid_string())
            .replace(&source.parent_name, self.name());
        debug!(xml = %xml, "rewritten clone definition");
        info!(
            parent_uuid = %source.parent_uuid,
            source_path = %source.path.display(),
            "starting to clone virtual machine"
        );
        self.change_presence(PresenceShow::DoNotDisturb, STATUS_CLONING)
            .await;

        let vm = self.arc();
        tokio::spawn(async move {
            if let Err(e) = vm.perform_cloning(&source.path, &xml).await {
                error!(error = %e, "cloning failed");
            }
        });
    }

    /// Copy every file from `source` into the VM folder, then define.
    async fn perform_cloning(&self, source: &Path, xml: &str) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let destination = self.folder().join(entry.file_name());
            debug!(
                from = %entry.path().display(),
                to = %destination.display(),
                "copying cloned artifact"
            );
            tokio::fs::copy(entry.path(), &destination).await?;
        }
        self.define(xml).await?;
        info!("cloning finished");
        Ok(())
    }
}
