//! Named in-process event bus with ordered subscriber invocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, warn};
use volary_bus::Jid;

/// The closed set of hook names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    VmCreate,
    VmShutoff,
    VmStop,
    VmDestroy,
    VmSuspend,
    VmResume,
    VmUndefine,
    VmDefine,
    VmInitialize,
    VmTerminate,
    VmFree,
    VmCrash,
    XmppConnect,
    XmppDisconnect,
    /// Fired by the entity layer once the bus session is authenticated.
    XmppAuthenticated,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::VmCreate => "HOOK_VM_CREATE",
            Hook::VmShutoff => "HOOK_VM_SHUTOFF",
            Hook::VmStop => "HOOK_VM_STOP",
            Hook::VmDestroy => "HOOK_VM_DESTROY",
            Hook::VmSuspend => "HOOK_VM_SUSPEND",
            Hook::VmResume => "HOOK_VM_RESUME",
            Hook::VmUndefine => "HOOK_VM_UNDEFINE",
            Hook::VmDefine => "HOOK_VM_DEFINE",
            Hook::VmInitialize => "HOOK_VM_INITIALIZE",
            Hook::VmTerminate => "HOOK_VM_TERMINATE",
            Hook::VmFree => "HOOK_VM_FREE",
            Hook::VmCrash => "HOOK_VM_CRASH",
            Hook::XmppConnect => "HOOK_XMPP_CONNECT",
            Hook::XmppDisconnect => "HOOK_XMPP_DISCONNECT",
            Hook::XmppAuthenticated => "HOOK_XMPP_AUTHENTICATED",
        }
    }
}

/// Context passed to every subscriber on firing.
#[derive(Debug, Clone, Default)]
pub struct HookEvent {
    /// The entity that caused the hook, if any.
    pub origin: Option<Jid>,
    /// Free-form information attached by the firing site.
    pub info: Option<String>,
}

type HookCallback<C> = Arc<dyn Fn(C, HookEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Ordered subscriber lists per hook.
///
/// `C` is the context value handed to each subscriber (the agent handle);
/// subscribers capture nothing so the bus itself never keeps the agent
/// alive.
pub struct HookBus<C> {
    subscribers: Mutex<HashMap<Hook, Vec<(String, HookCallback<C>)>>>,
}

impl<C: Clone> HookBus<C> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` on `hook`. Callbacks run in registration order.
    pub fn subscribe<F>(&self, hook: Hook, name: &str, callback: F)
    where
        F: Fn(C, HookEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        debug!(hook = hook.as_str(), subscriber = %name, "hook subscribed");
        self.subscribers
            .lock()
            .expect("hook table poisoned")
            .entry(hook)
            .or_default()
            .push((name.to_string(), Arc::new(callback)));
    }

    /// Fire `hook`, invoking subscribers in order. A failing subscriber is
    /// logged and does not stop the ones after it.
    pub async fn fire(&self, hook: Hook, ctx: C, event: HookEvent) {
        let subscribers: Vec<(String, HookCallback<C>)> = self
            .subscribers
            .lock()
            .expect("hook table poisoned")
            .get(&hook)
            .cloned()
            .unwrap_or_default();

        debug!(hook = hook.as_str(), count = subscribers.len(), "firing hook");
        for (name, callback) in subscribers {
            if let Err(e) = callback(ctx.clone(), event.clone()).await {
                warn!(hook = hook.as_str(), subscriber = %name, error = %e,
                      "hook subscriber failed");
            }
        }
    }
}

impl<C: Clone> Default for HookBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribers_run_in_registration_order() {
        let bus: HookBus<Arc<Mutex<Vec<&'static str>>>> = HookBus::new();
        bus.subscribe(Hook::VmCreate, "first", |log, _| {
            Box::pin(async move {
                log.lock().unwrap().push("first");
                Ok(())
            })
        });
        bus.subscribe(Hook::VmCreate, "second", |log, _| {
            Box::pin(async move {
                log.lock().unwrap().push("second");
                Ok(())
            })
        });

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.fire(Hook::VmCreate, log.clone(), HookEvent::default())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_does_not_stop_later_subscribers() {
        let bus: HookBus<Arc<AtomicUsize>> = HookBus::new();
        bus.subscribe(Hook::VmStop, "failing", |_, _| {
            Box::pin(async move { Err(anyhow::anyhow!("subscriber exploded")) })
        });
        bus.subscribe(Hook::VmStop, "counting", |count, _| {
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let count = Arc::new(AtomicUsize::new(0));
        bus.fire(Hook::VmStop, count.clone(), HookEvent::default())
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn firing_an_unsubscribed_hook_is_a_no_op() {
        let bus: HookBus<()> = HookBus::new();
        bus.fire(Hook::VmCrash, (), HookEvent::default()).await;
    }
}
