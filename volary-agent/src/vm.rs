//! The per-VM agent: state, lifecycle and event ingress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use volary_bus::{BusClient, Jid, PresenceShow, Request};
use volary_hypervisor::{
    DomainEvent, DomainState, Driver, ResumedDetail, StartedDetail, StoppedDetail, SuspendedDetail,
};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::hooks::{Hook, HookBus, HookEvent};
use crate::lock::LockGate;
use crate::permissions::PermissionCenter;
use crate::presence::presence_for;
use crate::protocol::*;
use crate::supervisor::Supervisor;
use crate::triggers::{Trigger, TriggerMode, TriggerRow, TriggerStore, Watcher, WatcherAction, WatcherRow};

/// Immutable identity of the supervised VM.
///
/// The bus address node part always equals the VM UUID; construction
/// enforces it.
#[derive(Debug, Clone)]
pub struct VmIdentity {
    pub uuid: Uuid,
    pub jid: Jid,
    pub name: String,
    pub(crate) password: String,
}

/// Live connection to the domain's lifecycle events.
struct Attachment {
    stream_id: u64,
    _pump: JoinHandle<()>,
}

/// Mutable agent state, guarded by one mutex.
pub(crate) struct Inner {
    attachment: Option<Attachment>,
    pub(crate) definition: Option<String>,
    pub(crate) status: DomainState,
    pub(crate) is_migrating: bool,
    driver_online: bool,
    show: PresenceShow,
    status_text: String,
    triggers: HashMap<String, Trigger>,
    watchers: HashMap<String, Watcher>,
}

/// A virtual machine agent.
///
/// One instance supervises one VM: it reflects the domain's state as bus
/// presence, serves typed requests, and turns driver lifecycle events into
/// change notifications and hooks.
pub struct VirtualMachine {
    weak: Weak<VirtualMachine>,
    identity: VmIdentity,
    folder: PathBuf,
    pub(crate) config: AgentConfig,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) lock: Arc<LockGate>,
    pub(crate) permissions: PermissionCenter,
    trigger_store: TriggerStore,
    hooks: HookBus<Arc<VirtualMachine>>,
    pub(crate) inner: Mutex<Inner>,
}

impl VirtualMachine {
    /// Build an agent for the VM addressed by `jid`.
    ///
    /// Creates the VM folder, opens the trigger and permission databases,
    /// registers the fixed permission set and wires the authenticated-hook
    /// sequence (trigger recovery, domain connect, vCard publish).
    pub fn new(
        jid: Jid,
        password: impl Into<String>,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        supervisor: Arc<dyn Supervisor>,
        bus: Arc<dyn BusClient>,
        config: AgentConfig,
    ) -> Result<Arc<Self>, AgentError> {
        let node = jid
            .node()
            .ok_or_else(|| AgentError::InvalidIdentity(jid.to_string()))?;
        let uuid =
            Uuid::parse_str(node).map_err(|_| AgentError::InvalidIdentity(node.to_string()))?;

        let folder = config.vm_base_path.join(uuid.to_string());
        std::fs::create_dir_all(&folder)?;

        let trigger_store = TriggerStore::open(&folder.join("triggers.sqlite3"))?;
        let permissions = PermissionCenter::open(
            &folder.join(&config.permissions_database_file),
            &config.root_admin,
        )?;
        for (permission, description) in PERMISSIONS {
            permissions.create_permission(permission, description, false)?;
        }

        let lock = LockGate::new(config.maximum_lock_time());
        let identity = VmIdentity {
            uuid,
            jid,
            name: name.into(),
            password: password.into(),
        };

        let vm = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            identity,
            folder,
            config,
            driver,
            supervisor,
            bus,
            lock,
            permissions,
            trigger_store,
            hooks: HookBus::new(),
            inner: Mutex::new(Inner {
                attachment: None,
                definition: None,
                status: DomainState::Shutdown,
                is_migrating: false,
                driver_online: true,
                show: PresenceShow::ExtendedAway,
                status_text: String::new(),
                triggers: HashMap::new(),
                watchers: HashMap::new(),
            }),
        });

        vm.hooks
            .subscribe(Hook::XmppAuthenticated, "trigger-recovery", |vm, _| {
                Box::pin(async move { vm.recover_triggers().await })
            });
        vm.hooks
            .subscribe(Hook::XmppAuthenticated, "domain-connect", |vm, _| {
                Box::pin(async move { vm.connect_domain().await })
            });
        vm.hooks
            .subscribe(Hook::XmppAuthenticated, "vcard-publish", |vm, _| {
                Box::pin(async move { vm.publish_vcard().await })
            });

        info!(jid = %vm.identity.jid, name = %vm.identity.name, "virtual machine agent created");
        Ok(vm)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn identity(&self) -> &VmIdentity {
        &self.identity
    }

    pub fn jid(&self) -> &Jid {
        &self.identity.jid
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn uuid_string(&self) -> String {
        self.identity.uuid.to_string()
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    pub fn hooks(&self) -> &HookBus<Arc<VirtualMachine>> {
        &self.hooks
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("agent already dropped")
    }

    pub(crate) async fn domain_attached(&self) -> bool {
        self.inner.lock().await.attachment.is_some()
    }

    pub async fn is_migrating(&self) -> bool {
        self.inner.lock().await.is_migrating
    }

    pub(crate) async fn driver_online(&self) -> bool {
        self.inner.lock().await.driver_online
    }

    /// The last published presence.
    pub async fn current_presence(&self) -> (PresenceShow, String) {
        let inner = self.inner.lock().await;
        (inner.show, inner.status_text.clone())
    }

    /// The last observed domain state.
    pub async fn current_status(&self) -> DomainState {
        self.inner.lock().await.status
    }

    /// The cached domain definition, if any.
    pub async fn definition_xml(&self) -> Option<String> {
        self.inner.lock().await.definition.clone()
    }

    /// The state of one of this agent's triggers.
    pub async fn trigger_state(&self, name: &str) -> Option<bool> {
        self.inner.lock().await.triggers.get(name).map(|t| t.state())
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Entry point for the entity layer: the bus session authenticated.
    pub async fn authenticated(&self) {
        info!("bus session authenticated");
        self.fire_hook(Hook::XmppAuthenticated).await;
    }

    /// The bus session connected (before authentication).
    pub async fn connected(&self) {
        self.fire_hook(Hook::XmppConnect).await;
    }

    /// Close databases and fire the terminate hook. Called by the
    /// supervisor when the VM is freed.
    pub async fn terminate(&self) {
        info!("terminating agent");
        self.permissions.close();
        self.trigger_store.close();
        self.fire_hook(Hook::VmTerminate).await;
    }

    /// Detach from the driver and close the bus session.
    pub async fn disconnect(&self) {
        info!(jid = %self.identity.jid, "disconnecting from everything");
        self.detach_events().await;
        {
            self.inner.lock().await.driver_online = false;
        }
        self.fire_hook(Hook::XmppDisconnect).await;
        if let Err(e) = self.bus.disconnect().await {
            warn!(error = %e, "bus disconnect failed");
        }
    }

    /// Ask the supervisor to fully remove this VM.
    pub async fn free(&self) -> Result<(), AgentError> {
        self.fire_hook(Hook::VmFree).await;
        self.supervisor
            .free(&self.identity.jid)
            .await
            .map_err(|e| AgentError::Other(e.to_string()))
    }

    /// Delete the VM folder with all its contents.
    pub fn remove_folder(&self) -> Result<(), AgentError> {
        info!(folder = %self.folder.display(), "removing VM folder");
        std::fs::remove_dir_all(&self.folder)?;
        Ok(())
    }

    /// Undefine the domain and close the bus session in one step.
    pub async fn undefine_and_disconnect(&self) -> Result<(), AgentError> {
        self.detach_events().await;
        self.driver.undefine(&self.uuid_string()).await?;
        {
            self.inner.lock().await.definition = None;
        }
        self.lock.unlock();
        self.disconnect().await;
        info!("virtual machine undefined and disconnected");
        Ok(())
    }

    pub(crate) async fn publish_vcard(&self) -> anyhow::Result<()> {
        self.bus
            .publish_vcard(&self.identity.name, self.config.default_avatar.as_deref())
            .await?;
        Ok(())
    }

    /// Process inbound requests until the channel closes, sending each reply
    /// back over the bus.
    pub async fn serve(self: Arc<Self>, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.recv().await {
            let from = request.from.clone();
            if let Some(reply) = self.handle_request(request).await {
                if let Err(e) = self.bus.send_reply(&from, reply).await {
                    warn!(to = %from, error = %e, "cannot send reply");
                }
            }
        }
        debug!("request stream ended");
    }

    // =========================================================================
    // Presence
    // =========================================================================

    pub(crate) async fn change_presence(&self, show: PresenceShow, status: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.show = show;
            inner.status_text = status.to_string();
        }
        if let Err(e) = self.bus.publish_presence(show, status).await {
            warn!(status = %status, error = %e, "cannot publish presence");
        }
    }

    /// Change only the status text, keeping the current show.
    pub(crate) async fn change_status_keep_show(&self, status: &str) {
        let show = {
            let inner = self.inner.lock().await;
            inner.show
        };
        self.change_presence(show, status).await;
    }

    pub(crate) async fn push_change(&self, channel: &str, event: &str) {
        if let Err(e) = self.bus.push_change(channel, event).await {
            warn!(channel = %channel, event = %event, error = %e,
                  "cannot push change notification");
        }
    }

    /// Set the `libvirt_run` trigger, publishing only actual transitions.
    pub(crate) async fn set_run_trigger(&self, state: bool) {
        let changed = {
            let mut inner = self.inner.lock().await;
            match inner.triggers.get_mut(TRIGGER_RUN) {
                Some(trigger) if trigger.state() != state => {
                    trigger.set_state(state);
                    true
                }
                Some(_) => false,
                None => {
                    debug!("run trigger not recovered yet, skipping");
                    false
                }
            }
        };
        if changed {
            if let Err(e) = self.bus.publish_trigger(TRIGGER_RUN, state).await {
                warn!(error = %e, "cannot publish trigger state");
            }
        }
    }

    /// Publish the presence derived from an observed domain state.
    pub(crate) async fn apply_domain_presence(&self, state: Option<DomainState>) {
        let update = presence_for(state);
        self.change_presence(update.show, update.status).await;
        self.set_run_trigger(update.run_trigger).await;
    }

    pub(crate) async fn fire_hook(&self, hook: Hook) {
        self.hooks.fire(hook, self.arc(), HookEvent::default()).await;
    }

    // =========================================================================
    // Triggers & watchers
    // =========================================================================

    /// Replay the trigger database into live triggers and watchers.
    pub(crate) async fn recover_triggers(&self) -> anyhow::Result<()> {
        info!("recovering triggers and watchers");
        let trigger_rows = self.trigger_store.load_triggers()?;
        let watcher_rows = self.trigger_store.load_watchers()?;

        {
            let mut inner = self.inner.lock().await;
            for row in trigger_rows {
                debug!(trigger = %row.name, "recovering trigger");
                let mut trigger = Trigger::new(row.name.clone(), row.description.clone());
                trigger.mode = row.mode;
                trigger.check_method = row.check_method.clone();
                trigger.check_interval = row.check_interval;
                inner.triggers.insert(row.name, trigger);
            }
        }

        for row in watcher_rows {
            debug!(watcher = %row.name, trigger = %row.trigger_name, "recovering watcher");
            let on_action: WatcherAction = match row.on_action.parse() {
                Ok(action) => action,
                Err(_) => {
                    warn!(watcher = %row.name, action = %row.on_action,
                          "unresolved watcher on-action, skipping");
                    continue;
                }
            };
            let off_action: WatcherAction = match row.off_action.parse() {
                Ok(action) => action,
                Err(_) => {
                    warn!(watcher = %row.name, action = %row.off_action,
                          "unresolved watcher off-action, skipping");
                    continue;
                }
            };
            let target: Jid = match row.target_jid.parse() {
                Ok(jid) => jid,
                Err(e) => {
                    warn!(watcher = %row.name, target = %row.target_jid, error = %e,
                          "invalid watcher target, skipping");
                    continue;
                }
            };

            let mut watcher = Watcher::new(
                row.name.clone(),
                target,
                row.trigger_name,
                on_action,
                off_action,
                row.enabled,
            );
            if watcher.enabled {
                if let Err(e) = watcher.watch(&self.arc()).await {
                    warn!(watcher = %row.name, error = %e, "cannot start watcher");
                }
            }
            self.inner.lock().await.watchers.insert(row.name, watcher);
        }

        self.add_trigger(TRIGGER_RUN, "basic trigger reflecting the running domain state")
            .await?;
        Ok(())
    }

    /// Create a trigger, persisting it. Idempotent on the name.
    pub async fn add_trigger(&self, name: &str, description: &str) -> Result<(), AgentError> {
        {
            let inner = self.inner.lock().await;
            if inner.triggers.contains_key(name) {
                return Ok(());
            }
        }
        self.trigger_store.insert_trigger(&TriggerRow {
            name: name.to_string(),
            description: description.to_string(),
            mode: TriggerMode::Manual,
            check_method: String::new(),
            check_interval: -1,
        })?;
        self.inner
            .lock()
            .await
            .triggers
            .insert(name.to_string(), Trigger::new(name, description));
        Ok(())
    }

    /// Remove a trigger from memory and storage.
    pub async fn remove_trigger(&self, name: &str) -> Result<(), AgentError> {
        self.trigger_store.delete_trigger(name)?;
        self.inner.lock().await.triggers.remove(name);
        Ok(())
    }

    /// Create a watcher, persisting it; starts watching when `enabled`.
    pub async fn add_watcher(
        &self,
        name: &str,
        target: Jid,
        trigger_name: &str,
        on_action: WatcherAction,
        off_action: WatcherAction,
        enabled: bool,
    ) -> Result<(), AgentError> {
        {
            let inner = self.inner.lock().await;
            if inner.watchers.contains_key(name) {
                return Ok(());
            }
        }
        self.trigger_store.insert_watcher(&WatcherRow {
            name: name.to_string(),
            target_jid: target.to_string(),
            trigger_name: trigger_name.to_string(),
            on_action: on_action.as_str().to_string(),
            off_action: off_action.as_str().to_string(),
            enabled,
        })?;
        let mut watcher = Watcher::new(name, target, trigger_name, on_action, off_action, enabled);
        if enabled {
            watcher.watch(&self.arc()).await?;
        }
        self.inner
            .lock()
            .await
            .watchers
            .insert(name.to_string(), watcher);
        Ok(())
    }

    /// Remove a watcher, stopping its observation.
    pub async fn remove_watcher(&self, name: &str) -> Result<(), AgentError> {
        self.trigger_store.delete_watcher(name)?;
        if let Some(mut watcher) = self.inner.lock().await.watchers.remove(name) {
            watcher.unwatch();
        }
        Ok(())
    }

    /// Whether a named watcher is actively observing.
    pub async fn watcher_active(&self, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .watchers
            .get(name)
            .map(|w| w.is_watching())
            .unwrap_or(false)
    }

    // =========================================================================
    // Domain connection
    // =========================================================================

    /// Attach to the domain named by this agent's UUID.
    ///
    /// A missing domain is not an error: presence becomes "Not defined" and
    /// the initialize hook still fires.
    pub(crate) async fn connect_domain(&self) -> anyhow::Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.attachment.is_some() {
                info!("already connected to domain, ignoring");
                return Ok(());
            }
        }
        let uuid = self.uuid_string();
        let exists = match self.driver.domain_exists(&uuid).await {
            Ok(exists) => exists,
            Err(e) if e.is_no_domain() => false,
            Err(e) => {
                error!(error = %e, "cannot look up domain");
                return Err(e.into());
            }
        };
        if !exists {
            warn!(uuid = %uuid, "cannot connect to domain with this uuid");
            self.apply_domain_presence(None).await;
            self.fire_hook(Hook::VmInitialize).await;
            return Ok(());
        }

        let definition = self.driver.xml_desc(&uuid, false).await?;
        let stream = self.driver.open_events(&uuid).await?;
        let pump = self.spawn_event_pump(stream.events);
        {
            let mut inner = self.inner.lock().await;
            inner.definition = Some(definition);
            inner.attachment = Some(Attachment {
                stream_id: stream.id,
                _pump: pump,
            });
        }
        info!(uuid = %uuid, "successfully connected to domain");
        self.set_presence_from_driver().await;
        self.fire_hook(Hook::VmInitialize).await;
        Ok(())
    }

    /// Read the domain state from the driver and publish matching presence.
    pub(crate) async fn set_presence_from_driver(&self) {
        match self.driver.domain_info(&self.uuid_string()).await {
            Ok(info) => {
                info!(state = info.state.as_str(), "virtual machine state");
                self.inner.lock().await.status = info.state;
                self.apply_domain_presence(Some(info.state)).await;
            }
            Err(e) if e.is_no_domain() => {
                info!("domain is gone, marking as not defined");
                self.detach_events().await;
                self.apply_domain_presence(None).await;
            }
            Err(e) => {
                error!(error = %e, "cannot read domain info");
            }
        }
    }

    fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<DomainEvent>,
    ) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(vm) = weak.upgrade() else { break };
                vm.on_domain_event(event).await;
            }
            debug!("domain event stream ended");
        })
    }

    /// Deregister the driver lifecycle listener, if any.
    pub(crate) async fn detach_events(&self) {
        let attachment = self.inner.lock().await.attachment.take();
        if let Some(attachment) = attachment {
            info!("removing the driver event listener");
            if let Err(e) = self.driver.close_events(attachment.stream_id).await {
                warn!(error = %e, "cannot close event stream");
            }
        }
    }

    // =========================================================================
    // Event ingress
    // =========================================================================

    /// Apply one driver lifecycle event.
    ///
    /// Within one event the sequence presence → change → trigger → hook →
    /// status refresh → unlock is fixed. Events received while migrating are
    /// dropped entirely.
    pub async fn on_domain_event(&self, event: DomainEvent) {
        info!(event = ?event, "driver lifecycle event received");
        let migrating = {
            let inner = self.inner.lock().await;
            inner.is_migrating
        };
        if migrating {
            info!("event received but virtual machine is migrating, ignoring");
            return;
        }

        match event {
            DomainEvent::Started(detail) if detail != StartedDetail::Migrated => {
                self.reflect(
                    Some(DomainState::Running),
                    CHANNEL_CONTROL,
                    "created",
                    Hook::VmCreate,
                )
                .await;
            }
            DomainEvent::Suspended(detail) if detail != SuspendedDetail::Migrated => {
                self.reflect(
                    Some(DomainState::Paused),
                    CHANNEL_CONTROL,
                    "suspended",
                    Hook::VmSuspend,
                )
                .await;
            }
            DomainEvent::Resumed(detail) if detail != ResumedDetail::Migrated => {
                self.reflect(
                    Some(DomainState::Running),
                    CHANNEL_CONTROL,
                    "resumed",
                    Hook::VmResume,
                )
                .await;
            }
            DomainEvent::Stopped(detail) if detail != StoppedDetail::Migrated => {
                self.reflect(
                    Some(DomainState::ShutOff),
                    CHANNEL_CONTROL,
                    "shutdowned",
                    Hook::VmStop,
                )
                .await;
            }
            DomainEvent::Crashed => {
                self.reflect(
                    Some(DomainState::Crashed),
                    CHANNEL_CONTROL,
                    "crashed",
                    Hook::VmCrash,
                )
                .await;
            }
            DomainEvent::Shutoff => {
                self.reflect(
                    Some(DomainState::ShutOff),
                    CHANNEL_CONTROL,
                    "shutoff",
                    Hook::VmShutoff,
                )
                .await;
            }
            DomainEvent::Undefined => {
                self.reflect(None, CHANNEL_DEFINITION, "undefined", Hook::VmUndefine)
                    .await;
                {
                    self.inner.lock().await.definition = None;
                }
                self.detach_events().await;
            }
            DomainEvent::Defined => {
                self.reflect(
                    Some(DomainState::ShutOff),
                    CHANNEL_DEFINITION,
                    "defined",
                    Hook::VmDefine,
                )
                .await;
            }
            _ => {
                debug!("migration handshake artifact, no state change");
            }
        }

        // No domain info is reachable right after defined/undefined.
        if !event.is_definition_event() {
            if let Ok(info) = self.driver.domain_info(&self.uuid_string()).await {
                self.inner.lock().await.status = info.state;
            }
        }
        self.lock.unlock();
    }

    async fn reflect(&self, state: Option<DomainState>, channel: &str, label: &str, hook: Hook) {
        let update = presence_for(state);
        self.change_presence(update.show, update.status).await;
        self.push_change(channel, label).await;
        self.set_run_trigger(update.run_trigger).await;
        self.fire_hook(hook).await;
    }

    /// Run a watcher action against this VM, honoring the lock gate.
    pub(crate) async fn run_watcher_action(&self, action: WatcherAction) -> Result<(), AgentError> {
        if !self.lock.try_lock() {
            return Err(AgentError::Locked);
        }
        let result = match action {
            WatcherAction::Create => self.create().await.map(|_| ()),
            WatcherAction::Shutdown => self.shutdown_domain().await,
            WatcherAction::Destroy => self.destroy_domain().await,
            WatcherAction::Suspend => self.suspend_domain().await,
            WatcherAction::Resume => self.resume_domain().await,
        };
        if result.is_err() {
            self.lock.unlock();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;
    use volary_bus::{IqResponse, Jid, MockBus, PresenceShow, Reply, ReplyPayload};
    use volary_hypervisor::{
        DomainEvent, DomainState, Driver, DriverKind, MockDriver, StartedDetail,
    };

    use crate::cloning::CloneSource;
    use crate::error::AgentError;
    use crate::hooks::Hook;
    use crate::protocol::{codes, NS_HYPERVISOR_CONTROL, TRIGGER_RUN};
    use crate::supervisor::MockSupervisor;
    use crate::test_support::*;
    use crate::triggers::{TriggerMode, TriggerRow, TriggerStore, WatcherRow};

    use super::VirtualMachine;

    #[tokio::test]
    async fn construction_rejects_non_uuid_addresses() {
        let dir = TempDir::new().unwrap();
        let result = VirtualMachine::new(
            "not-a-uuid@bus.local".parse().unwrap(),
            VM_PASSWORD,
            VM_NAME,
            Arc::new(MockDriver::new(DriverKind::Test)),
            Arc::new(MockSupervisor::new("hv@bus.local".parse().unwrap())),
            Arc::new(MockBus::new()),
            test_config(&dir),
        );
        assert!(matches!(result, Err(AgentError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn start_flow_runs_the_full_event_sequence() {
        let f = fixture(DriverKind::Qemu, true).await;

        // authentication attached to a shut-off domain
        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::ExtendedAway, "Shutted off".to_string()))
        );

        let fired = Arc::new(AtomicBool::new(false));
        let probe = fired.clone();
        f.vm.hooks().subscribe(Hook::VmCreate, "probe", move |_, _| {
            let probe = probe.clone();
            Box::pin(async move {
                probe.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let reply = f.vm.handle_request(control("create")).await.unwrap();
        let Reply::Result {
            payload: ReplyPayload::Domain { id },
            ..
        } = reply
        else {
            panic!("expected domain payload");
        };
        assert!(id > 0);
        assert!(f.vm.is_locked());

        // the driver confirms asynchronously
        f.vm.on_domain_event(DomainEvent::Started(StartedDetail::Booted))
            .await;

        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::Available, "Running".to_string()))
        );
        assert_eq!(f.vm.trigger_state(TRIGGER_RUN).await, Some(true));
        assert!(f
            .bus
            .changes()
            .contains(&("virtualmachine:control".to_string(), "created".to_string())));
        assert!(fired.load(Ordering::SeqCst));
        assert!(!f.vm.is_locked());
        assert_eq!(f.vm.current_status().await, DomainState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timer_unwedges_a_lost_confirmation() {
        let f = fixture(DriverKind::Qemu, true).await;

        f.vm.handle_request(control("create")).await.unwrap();
        assert!(f.vm.is_locked());
        settle().await;

        // no event ever arrives
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(!f.vm.is_locked());

        let reply = f.vm.handle_request(control("shutdown")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
    }

    #[tokio::test]
    async fn define_undefine_round_trip() {
        let f = fixture(DriverKind::Test, false).await;
        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::ExtendedAway, "Not defined".to_string()))
        );

        let reply = f
            .vm
            .handle_request(definition("define").with_domain_xml(domain_xml()))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Result { .. }));

        assert!(f.vm.domain_attached().await);
        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::ExtendedAway, "Shutted off".to_string()))
        );
        assert!(f
            .bus
            .changes()
            .contains(&("virtualmachine:definition".to_string(), "defined".to_string())));

        // the stored definition carries the bus credentials and the display name
        let stored = f.vm.definition_xml().await.unwrap();
        assert!(stored.contains(&format!(
            "{}@bus.local::::{}",
            VM_UUID, VM_PASSWORD
        )));
        assert!(stored.contains(VM_NAME));

        let reply = f.vm.handle_request(definition("undefine")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert!(!f.vm.domain_attached().await);
        assert!(f.vm.definition_xml().await.is_none());
        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::ExtendedAway, "Not defined".to_string()))
        );
        assert!(f.bus.changes().contains(&(
            "virtualmachine:definition".to_string(),
            "undefined".to_string()
        )));

        // idempotent on a null domain
        let reply = f.vm.handle_request(definition("undefine")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
    }

    #[tokio::test]
    async fn xmldesc_never_leaks_the_credentials() {
        let f = fixture(DriverKind::Test, false).await;
        f.vm.handle_request(definition("define").with_domain_xml(domain_xml()))
            .await
            .unwrap();

        // the driver-side document does carry them
        let raw = f.driver.inspect_domain(VM_UUID, |d| d.xml.clone()).unwrap();
        assert!(raw.contains(VM_PASSWORD));

        let reply = f.vm.handle_request(control("xmldesc")).await.unwrap();
        let Reply::Result {
            payload: ReplyPayload::Xml { document },
            ..
        } = reply
        else {
            panic!("expected xml payload");
        };
        assert!(!document.contains(VM_PASSWORD));
        assert!(!document.contains("description"));
    }

    #[tokio::test]
    async fn migration_flow_queries_the_peer_and_guards_requests() {
        let f = fixture(DriverKind::Qemu, true).await;
        // the domain runs behind the agent's back
        f.driver.create(VM_UUID).await.unwrap();

        let target: Jid = "hv2@bus.local".parse().unwrap();
        f.bus.expect_iq(
            &target,
            NS_HYPERVISOR_CONTROL,
            "uri",
            IqResponse::default().with_value("uri", "qemu+tcp://peer/system"),
        );

        let reply = f
            .vm
            .handle_request(control("migrate").with_hypervisor_jid("hv2@bus.local"))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert!(f.vm.is_migrating().await);
        assert_eq!(f.bus.last_presence().unwrap().1, "Migrating...");

        settle().await;
        let migrations = f.driver.migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].1, "qemu+tcp://peer/system");
        // peer-to-peer | persist-destination | live
        assert_eq!(migrations[0].2, 0b1011);

        // mutations are fenced, reads still served
        let reply = f.vm.handle_request(control("shutdown")).await.unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATING);
        let reply = f.vm.handle_request(control("info")).await.unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
    }

    #[tokio::test]
    async fn migration_transfer_failure_clears_the_flag_and_shouts() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.driver.create(VM_UUID).await.unwrap();
        f.driver.inject_failure(
            "migrate_to_uri",
            volary_hypervisor::DriverError::OperationFailed("network down".into()),
        );

        let target: Jid = "hv2@bus.local".parse().unwrap();
        f.bus.expect_iq(
            &target,
            NS_HYPERVISOR_CONTROL,
            "uri",
            IqResponse::default().with_value("uri", "qemu+tcp://peer/system"),
        );
        f.vm
            .handle_request(control("migrate").with_hypervisor_jid("hv2@bus.local"))
            .await
            .unwrap();
        settle().await;

        assert!(!f.vm.is_migrating().await);
        assert_eq!(f.bus.last_presence().unwrap().1, "Can't migrate.");
        let shouts = f.bus.group_messages();
        assert_eq!(shouts.len(), 1);
        assert_eq!(shouts[0].0, "migration");
        assert!(shouts[0].1.contains("network down"));
    }

    #[tokio::test]
    async fn migration_preconditions_are_enforced() {
        // not running
        let f = fixture(DriverKind::Qemu, true).await;
        let reply = f
            .vm
            .handle_request(control("migrate").with_hypervisor_jid("hv2@bus.local"))
            .await
            .unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATE);
        assert!(!f.vm.is_migrating().await);

        // target is the local hypervisor
        f.driver.create(VM_UUID).await.unwrap();
        let reply = f
            .vm
            .handle_request(control("migrate").with_hypervisor_jid("hypervisor@bus.local"))
            .await
            .unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATE);
        assert!(!f.vm.is_migrating().await);

        // non-QEMU driver family
        let f = fixture(DriverKind::Test, true).await;
        f.driver.create(VM_UUID).await.unwrap();
        let reply = f
            .vm
            .handle_request(control("migrate").with_hypervisor_jid("hv2@bus.local"))
            .await
            .unwrap();
        assert_eq!(reply.wire_error().unwrap().code, codes::VM_MIGRATE);
    }

    #[tokio::test]
    async fn events_during_migration_change_nothing() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.vm.inner.lock().await.is_migrating = true;

        let fired = Arc::new(AtomicBool::new(false));
        let probe = fired.clone();
        f.vm.hooks().subscribe(Hook::VmCreate, "probe", move |_, _| {
            let probe = probe.clone();
            Box::pin(async move {
                probe.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let presences = f.bus.presences().len();
        let changes = f.bus.changes().len();
        f.vm.on_domain_event(DomainEvent::Started(StartedDetail::Booted))
            .await;

        assert_eq!(f.bus.presences().len(), presences);
        assert_eq!(f.bus.changes().len(), changes);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn migration_handshake_artifacts_do_not_flip_presence() {
        let f = fixture(DriverKind::Qemu, true).await;
        let presences = f.bus.presences().len();

        f.vm.on_domain_event(DomainEvent::Started(StartedDetail::Migrated))
            .await;

        assert_eq!(f.bus.presences().len(), presences);
        // but the ingress still refreshed the cached status and unlocked
        assert!(!f.vm.is_locked());
    }

    #[tokio::test]
    async fn recovery_restores_triggers_and_watchers() {
        let dir = TempDir::new().unwrap();
        let vm_folder = dir.path().join(VM_UUID);
        std::fs::create_dir_all(&vm_folder).unwrap();
        {
            let store = TriggerStore::open(&vm_folder.join("triggers.sqlite3")).unwrap();
            store
                .insert_trigger(&TriggerRow {
                    name: TRIGGER_RUN.to_string(),
                    description: "running state".to_string(),
                    mode: TriggerMode::Manual,
                    check_method: String::new(),
                    check_interval: -1,
                })
                .unwrap();
            store
                .insert_watcher(&WatcherRow {
                    name: "w1".to_string(),
                    target_jid: "peer@host".to_string(),
                    trigger_name: TRIGGER_RUN.to_string(),
                    on_action: "create".to_string(),
                    off_action: "shutdown".to_string(),
                    enabled: true,
                })
                .unwrap();
            store.close();
        }

        let driver = Arc::new(MockDriver::new(DriverKind::Test));
        driver.add_domain(VM_UUID, sample_domain());
        let bus = Arc::new(MockBus::new());
        let supervisor = Arc::new(MockSupervisor::new("hv@bus.local".parse().unwrap()));
        let vm = VirtualMachine::new(
            format!("{}@bus.local", VM_UUID).parse().unwrap(),
            VM_PASSWORD,
            VM_NAME,
            driver.clone(),
            supervisor,
            bus.clone(),
            test_config(&dir),
        )
        .unwrap();

        vm.authenticated().await;

        assert_eq!(vm.trigger_state(TRIGGER_RUN).await, Some(false));
        assert!(vm.watcher_active("w1").await);
        assert_eq!(bus.trigger_subscription_count(), 1);

        // the remote trigger flips on: the watcher starts the domain
        bus.feed_trigger(&"peer@host".parse().unwrap(), TRIGGER_RUN, true);
        settle().await;
        assert_eq!(
            driver.inspect_domain(VM_UUID, |d| d.state).unwrap(),
            DomainState::Running
        );
    }

    #[tokio::test]
    async fn unresolved_watcher_actions_are_skipped() {
        let dir = TempDir::new().unwrap();
        let vm_folder = dir.path().join(VM_UUID);
        std::fs::create_dir_all(&vm_folder).unwrap();
        {
            let store = TriggerStore::open(&vm_folder.join("triggers.sqlite3")).unwrap();
            store
                .insert_watcher(&WatcherRow {
                    name: "stale".to_string(),
                    target_jid: "peer@host".to_string(),
                    trigger_name: TRIGGER_RUN.to_string(),
                    on_action: "on_fn".to_string(),
                    off_action: "off_fn".to_string(),
                    enabled: true,
                })
                .unwrap();
            store.close();
        }

        let bus = Arc::new(MockBus::new());
        let vm = VirtualMachine::new(
            format!("{}@bus.local", VM_UUID).parse().unwrap(),
            VM_PASSWORD,
            VM_NAME,
            Arc::new(MockDriver::new(DriverKind::Test)),
            Arc::new(MockSupervisor::new("hv@bus.local".parse().unwrap())),
            bus.clone(),
            test_config(&dir),
        )
        .unwrap();

        vm.authenticated().await;
        assert!(!vm.watcher_active("stale").await);
        assert_eq!(bus.trigger_subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_change_is_confirmed_by_the_poll() {
        let f = fixture(DriverKind::Qemu, true).await;

        let reply = f
            .vm
            .handle_request(control("memory").with_value(2048))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Result { .. }));
        assert!(!f
            .bus
            .changes()
            .contains(&("virtualmachine:control".to_string(), "memory".to_string())));
        settle().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        assert!(f
            .bus
            .changes()
            .contains(&("virtualmachine:control".to_string(), "memory".to_string())));
        assert_eq!(
            f.driver.inspect_domain(VM_UUID, |d| d.memory_kib).unwrap(),
            2048
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_poll_gives_up_after_bounded_retries() {
        let f = fixture(DriverKind::Qemu, true).await;

        // ask for far more than the driver will apply: the ratio never
        // reaches 0 or 1, so the poll can only finish by running out
        f.vm.handle_request(control("memory").with_value(4 * 1_048_576))
            .await
            .unwrap();
        settle().await;

        let memory_change = ("virtualmachine:control".to_string(), "memory".to_string());
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
            assert!(!f.bus.changes().contains(&memory_change));
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        // emitted unconditionally once the retries ran out
        assert!(f.bus.changes().contains(&memory_change));
    }

    #[tokio::test]
    async fn clone_provisions_from_the_parent_folder() {
        let f = fixture(DriverKind::Test, false).await;

        let source_dir = TempDir::new().unwrap();
        std::fs::write(source_dir.path().join("disk.qcow2"), b"disk-bytes").unwrap();
        const PARENT_UUID: &str = "99999999-8888-7777-6666-555555555555";
        let parent_xml = domain_xml()
            .replace(VM_UUID, PARENT_UUID)
            .replace(VM_NAME, "parent-vm");

        f.vm.clone_from_parent(CloneSource {
            definition: parent_xml,
            path: source_dir.path().to_path_buf(),
            parent_uuid: PARENT_UUID.to_string(),
            parent_name: "parent-vm".to_string(),
        })
        .await;

        assert_eq!(
            f.bus.last_presence(),
            Some((PresenceShow::DoNotDisturb, "Cloning...".to_string()))
        );

        // wait for the background copy + define
        for _ in 0..100 {
            if f.vm.domain_attached().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(f.vm.domain_attached().await);
        assert!(f.vm.folder().join("disk.qcow2").exists());
        let stored = f.vm.definition_xml().await.unwrap();
        assert!(stored.contains(VM_UUID));
        assert!(!stored.contains(PARENT_UUID));
    }

    #[tokio::test]
    async fn terminate_closes_the_databases() {
        let f = fixture(DriverKind::Qemu, true).await;

        let fired = Arc::new(AtomicBool::new(false));
        let probe = fired.clone();
        f.vm.hooks()
            .subscribe(Hook::VmTerminate, "probe", move |_, _| {
                let probe = probe.clone();
                Box::pin(async move {
                    probe.store(true, Ordering::SeqCst);
                    Ok(())
                })
            });

        f.vm.terminate().await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(
            f.vm.add_trigger("x", "y").await,
            Err(AgentError::StoreClosed)
        ));
        // a non-admin check now falls through to denial
        assert!(!f.vm.permissions.check("user@bus.local", "info"));
    }

    #[tokio::test]
    async fn disconnect_silences_the_router() {
        let f = fixture(DriverKind::Qemu, true).await;
        f.vm.disconnect().await;

        assert!(f.bus.is_disconnected());
        // control requests abort silently without a driver connection
        assert!(f.vm.handle_request(control("create")).await.is_none());
    }
}
