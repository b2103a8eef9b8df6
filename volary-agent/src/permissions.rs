//! Per-VM permission center.
//!
//! Named permissions with a per-subject override table, persisted in the
//! VM's folder. Checks are deny-by-default: an action passes only when the
//! subject has an explicit grant, the permission's default allows it, or
//! the subject is the root admin.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::AgentError;

/// Named-permission checks per (subject, action).
pub struct PermissionCenter {
    conn: Mutex<Option<Connection>>,
    root_admin: String,
}

impl PermissionCenter {
    /// Open (creating if missing) the permission database at `path`.
    pub fn open(path: &Path, root_admin: &str) -> Result<Self, AgentError> {
        info!(path = %path.display(), "opening permission database");
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS permissions (
                 name TEXT PRIMARY KEY,
                 description TEXT NOT NULL,
                 default_granted INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS acls (
                 subject TEXT NOT NULL,
                 permission TEXT NOT NULL,
                 granted INTEGER NOT NULL,
                 PRIMARY KEY (subject, permission)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            root_admin: root_admin.to_string(),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, AgentError> {
        let guard = self.conn.lock().expect("permission database poisoned");
        let conn = guard.as_ref().ok_or(AgentError::StoreClosed)?;
        Ok(f(conn)?)
    }

    /// Register a permission. Existing rows keep their description and
    /// default; registration is idempotent.
    pub fn create_permission(
        &self,
        name: &str,
        description: &str,
        default_granted: bool,
    ) -> Result<(), AgentError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO permissions (name, description, default_granted)
                 VALUES (?1, ?2, ?3)",
                params![name, description, default_granted as i64],
            )
            .map(|_| ())
        })
    }

    /// Grant `permission` to `subject`.
    pub fn grant(&self, subject: &str, permission: &str) -> Result<(), AgentError> {
        self.set_acl(subject, permission, true)
    }

    /// Revoke `permission` from `subject`, overriding a permissive default.
    pub fn revoke(&self, subject: &str, permission: &str) -> Result<(), AgentError> {
        self.set_acl(subject, permission, false)
    }

    fn set_acl(&self, subject: &str, permission: &str, granted: bool) -> Result<(), AgentError> {
        debug!(subject = %subject, permission = %permission, granted, "updating acl");
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO acls (subject, permission, granted)
                 VALUES (?1, ?2, ?3)",
                params![subject, permission, granted as i64],
            )
            .map(|_| ())
        })
    }

    /// Whether `subject` may perform `permission`.
    ///
    /// Storage failures count as denial and are logged.
    pub fn check(&self, subject: &str, permission: &str) -> bool {
        if subject == self.root_admin {
            return true;
        }
        let decision = self.with_conn(|conn| {
            let explicit: Option<i64> = conn
                .query_row(
                    "SELECT granted FROM acls WHERE subject = ?1 AND permission = ?2",
                    params![subject, permission],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(granted) = explicit {
                return Ok(granted != 0);
            }
            let default: Option<i64> = conn
                .query_row(
                    "SELECT default_granted FROM permissions WHERE name = ?1",
                    params![permission],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(default.map(|d| d != 0).unwrap_or(false))
        });
        match decision {
            Ok(granted) => granted,
            Err(e) => {
                warn!(subject = %subject, permission = %permission, error = %e,
                      "permission check failed, denying");
                false
            }
        }
    }

    /// Close the database. Further operations fail with `StoreClosed`.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("permission database poisoned");
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "failed to close permission database");
            }
        }
    }
}
