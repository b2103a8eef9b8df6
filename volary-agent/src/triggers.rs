//! Triggers, watchers and their durable store.
//!
//! A trigger is a named observable boolean this agent publishes; a watcher
//! observes another agent's trigger and runs a local action on transitions.
//! Both are persisted in the VM folder and recovered when the bus session
//! authenticates.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use volary_bus::Jid;

use crate::error::AgentError;
use crate::vm::VirtualMachine;

/// How a trigger's state is maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// State is set explicitly by the agent.
    Manual,
    /// State is derived by polling a check method.
    Auto,
}

impl TriggerMode {
    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            TriggerMode::Auto
        } else {
            TriggerMode::Manual
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            TriggerMode::Manual => 0,
            TriggerMode::Auto => 1,
        }
    }
}

/// A named observable boolean published on the bus.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub description: String,
    pub mode: TriggerMode,
    pub check_method: String,
    pub check_interval: i64,
    state: bool,
}

impl Trigger {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            mode: TriggerMode::Manual,
            check_method: String::new(),
            check_interval: -1,
            state: false,
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: bool) {
        self.state = state;
    }
}

/// Local actions a watcher may invoke, resolved at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherAction {
    Create,
    Shutdown,
    Destroy,
    Suspend,
    Resume,
}

impl WatcherAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherAction::Create => "create",
            WatcherAction::Shutdown => "shutdown",
            WatcherAction::Destroy => "destroy",
            WatcherAction::Suspend => "suspend",
            WatcherAction::Resume => "resume",
        }
    }
}

impl FromStr for WatcherAction {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create" => WatcherAction::Create,
            "shutdown" => WatcherAction::Shutdown,
            "destroy" => WatcherAction::Destroy,
            "suspend" => WatcherAction::Suspend,
            "resume" => WatcherAction::Resume,
            other => {
                return Err(AgentError::Other(format!(
                    "unknown watcher action: {}",
                    other
                )))
            }
        })
    }
}

/// A subscription to a remote trigger.
///
/// While watching, a background task observes the remote state and invokes
/// the on/off action on each transition.
pub struct Watcher {
    pub name: String,
    pub target: Jid,
    pub trigger_name: String,
    pub on_action: WatcherAction,
    pub off_action: WatcherAction,
    /// Persisted on/off state of the watcher itself.
    pub enabled: bool,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn new(
        name: impl Into<String>,
        target: Jid,
        trigger_name: impl Into<String>,
        on_action: WatcherAction,
        off_action: WatcherAction,
        enabled: bool,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            trigger_name: trigger_name.into(),
            on_action,
            off_action,
            enabled,
            task: None,
        }
    }

    /// Begin observing the remote trigger.
    pub async fn watch(&mut self, vm: &Arc<VirtualMachine>) -> Result<(), AgentError> {
        if self.task.is_some() {
            return Ok(());
        }
        info!(watcher = %self.name, target = %self.target, trigger = %self.trigger_name,
              "watching remote trigger");
        let mut watch = vm
            .bus()
            .subscribe_trigger(&self.target, &self.trigger_name)
            .await?;

        let weak = Arc::downgrade(vm);
        let name = self.name.clone();
        let (on_action, off_action) = (self.on_action, self.off_action);
        self.task = Some(tokio::spawn(async move {
            while let Some(state) = watch.states.recv().await {
                let Some(vm) = weak.upgrade() else { break };
                let action = if state { on_action } else { off_action };
                debug!(watcher = %name, state, action = action.as_str(),
                       "remote trigger transition");
                if let Err(e) = vm.run_watcher_action(action).await {
                    warn!(watcher = %name, action = action.as_str(), error = %e,
                          "watcher action failed");
                }
            }
            debug!(watcher = %name, "watch ended");
        }));
        Ok(())
    }

    /// Stop observing. The only cancellation the agent supports besides the
    /// lock safety timer.
    pub fn unwatch(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// A persisted trigger row.
#[derive(Debug, Clone)]
pub struct TriggerRow {
    pub name: String,
    pub description: String,
    pub mode: TriggerMode,
    pub check_method: String,
    pub check_interval: i64,
}

/// A persisted watcher row.
#[derive(Debug, Clone)]
pub struct WatcherRow {
    pub name: String,
    pub target_jid: String,
    pub trigger_name: String,
    pub on_action: String,
    pub off_action: String,
    pub enabled: bool,
}

/// Durable table of triggers and watchers, one database per VM.
pub struct TriggerStore {
    conn: Mutex<Option<Connection>>,
}

impl TriggerStore {
    /// Open (creating if missing) the trigger database at `path`.
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        info!(path = %path.display(), "opening trigger database");
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS triggers (
                 name TEXT,
                 description TEXT,
                 mode INTEGER,
                 check_method TEXT,
                 check_interval INTEGER
             );
             CREATE TABLE IF NOT EXISTS watchers (
                 name TEXT,
                 targetjid TEXT,
                 triggername TEXT,
                 triggeronaction TEXT,
                 triggeroffaction TEXT,
                 state INTEGER
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, AgentError> {
        let guard = self.conn.lock().expect("trigger database poisoned");
        let conn = guard.as_ref().ok_or(AgentError::StoreClosed)?;
        Ok(f(conn)?)
    }

    pub fn load_triggers(&self) -> Result<Vec<TriggerRow>, AgentError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, mode, check_method, check_interval FROM triggers",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(TriggerRow {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    mode: TriggerMode::from_i64(row.get(2)?),
                    check_method: row.get(3)?,
                    check_interval: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn load_watchers(&self) -> Result<Vec<WatcherRow>, AgentError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, targetjid, triggername, triggeronaction, triggeroffaction, state
                 FROM watchers",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(WatcherRow {
                    name: row.get(0)?,
                    target_jid: row.get(1)?,
                    trigger_name: row.get(2)?,
                    on_action: row.get(3)?,
                    off_action: row.get(4)?,
                    enabled: row.get::<_, i64>(5)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    pub fn insert_trigger(&self, row: &TriggerRow) -> Result<(), AgentError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO triggers VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.name,
                    row.description,
                    row.mode.as_i64(),
                    row.check_method,
                    row.check_interval
                ],
            )
            .map(|_| ())
        })
    }

    pub fn delete_trigger(&self, name: &str) -> Result<(), AgentError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM triggers WHERE name = ?1", params![name])
                .map(|_| ())
        })
    }

    pub fn insert_watcher(&self, row: &WatcherRow) -> Result<(), AgentError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO watchers VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.name,
                    row.target_jid,
                    row.trigger_name,
                    row.on_action,
                    row.off_action,
                    row.enabled as i64
                ],
            )
            .map(|_| ())
        })
    }

    pub fn delete_watcher(&self, name: &str) -> Result<(), AgentError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM watchers WHERE name = ?1", params![name])
                .map(|_| ())
        })
    }

    /// Close the database. Further operations fail with `StoreClosed`.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("trigger database poisoned");
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "failed to close trigger database");
            }
        }
    }
}
