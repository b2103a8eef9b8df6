//! Mock bus client for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{BusClient, IqResponse, TriggerWatch};
use crate::error::{BusError, Result};
use crate::jid::Jid;
use crate::presence::PresenceShow;
use crate::stanza::Reply;

/// Recording bus client.
///
/// Every publication is captured for later inspection; peer IQ answers are
/// canned with [`MockBus::expect_iq`] and trigger observations are driven
/// with [`MockBus::feed_trigger`].
#[derive(Default)]
pub struct MockBus {
    presences: Mutex<Vec<(PresenceShow, String)>>,
    changes: Mutex<Vec<(String, String)>>,
    trigger_states: Mutex<Vec<(String, bool)>>,
    replies: Mutex<Vec<(Jid, Reply)>>,
    group_messages: Mutex<Vec<(String, String)>>,
    vcards: Mutex<Vec<String>>,
    iq_responses: Mutex<HashMap<(String, String, String), IqResponse>>,
    trigger_feeds: Mutex<Vec<(String, String, mpsc::UnboundedSender<bool>)>>,
    disconnected: AtomicBool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange the answer for an `iq_get(to, ns, action)` call.
    pub fn expect_iq(&self, to: &Jid, ns: &str, action: &str, response: IqResponse) {
        self.iq_responses.lock().expect("mock poisoned").insert(
            (to.bare().to_string(), ns.to_string(), action.to_string()),
            response,
        );
    }

    /// Push a state transition into every live subscription on
    /// (`target`, `trigger`).
    pub fn feed_trigger(&self, target: &Jid, trigger: &str, state: bool) {
        let feeds = self.trigger_feeds.lock().expect("mock poisoned");
        for (t, name, tx) in feeds.iter() {
            if t == &target.bare().to_string() && name == trigger {
                let _ = tx.send(state);
            }
        }
    }

    /// All presences published so far, oldest first.
    pub fn presences(&self) -> Vec<(PresenceShow, String)> {
        self.presences.lock().expect("mock poisoned").clone()
    }

    /// The most recently published presence.
    pub fn last_presence(&self) -> Option<(PresenceShow, String)> {
        self.presences.lock().expect("mock poisoned").last().cloned()
    }

    /// All change notifications pushed so far.
    pub fn changes(&self) -> Vec<(String, String)> {
        self.changes.lock().expect("mock poisoned").clone()
    }

    /// All trigger-state publications so far.
    pub fn trigger_states(&self) -> Vec<(String, bool)> {
        self.trigger_states.lock().expect("mock poisoned").clone()
    }

    /// All replies sent so far.
    pub fn replies(&self) -> Vec<(Jid, Reply)> {
        self.replies.lock().expect("mock poisoned").clone()
    }

    /// All group-chat broadcasts so far.
    pub fn group_messages(&self) -> Vec<(String, String)> {
        self.group_messages.lock().expect("mock poisoned").clone()
    }

    /// All vCard publications so far.
    pub fn vcards(&self) -> Vec<String> {
        self.vcards.lock().expect("mock poisoned").clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Number of live trigger subscriptions.
    pub fn trigger_subscription_count(&self) -> usize {
        self.trigger_feeds
            .lock()
            .expect("mock poisoned")
            .iter()
            .filter(|(_, _, tx)| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl BusClient for MockBus {
    async fn publish_presence(&self, show: PresenceShow, status: &str) -> Result<()> {
        debug!(show = show.as_str(), status = %status, "mock presence");
        self.presences
            .lock()
            .expect("mock poisoned")
            .push((show, status.to_string()));
        Ok(())
    }

    async fn push_change(&self, channel: &str, event: &str) -> Result<()> {
        debug!(channel = %channel, event = %event, "mock change notification");
        self.changes
            .lock()
            .expect("mock poisoned")
            .push((channel.to_string(), event.to_string()));
        Ok(())
    }

    async fn publish_trigger(&self, name: &str, state: bool) -> Result<()> {
        self.trigger_states
            .lock()
            .expect("mock poisoned")
            .push((name.to_string(), state));
        Ok(())
    }

    async fn subscribe_trigger(&self, target: &Jid, trigger: &str) -> Result<TriggerWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.trigger_feeds.lock().expect("mock poisoned").push((
            target.bare().to_string(),
            trigger.to_string(),
            tx,
        ));
        Ok(TriggerWatch { states: rx })
    }

    async fn send_reply(&self, to: &Jid, reply: Reply) -> Result<()> {
        self.replies
            .lock()
            .expect("mock poisoned")
            .push((to.clone(), reply));
        Ok(())
    }

    async fn iq_get(&self, to: &Jid, ns: &str, action: &str) -> Result<IqResponse> {
        let key = (to.bare().to_string(), ns.to_string(), action.to_string());
        self.iq_responses
            .lock()
            .expect("mock poisoned")
            .get(&key)
            .cloned()
            .ok_or_else(|| BusError::NoResponse(to.to_string()))
    }

    async fn group_message(&self, subject: &str, body: &str) -> Result<()> {
        self.group_messages
            .lock()
            .expect("mock poisoned")
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }

    async fn publish_vcard(&self, name: &str, _avatar: Option<&str>) -> Result<()> {
        self.vcards
            .lock()
            .expect("mock poisoned")
            .push(name.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_presence_and_changes() {
        let bus = MockBus::new();
        bus.publish_presence(PresenceShow::Available, "Running")
            .await
            .unwrap();
        bus.push_change("virtualmachine:control", "created")
            .await
            .unwrap();

        assert_eq!(
            bus.last_presence(),
            Some((PresenceShow::Available, "Running".to_string()))
        );
        assert_eq!(
            bus.changes(),
            vec![("virtualmachine:control".to_string(), "created".to_string())]
        );
    }

    #[tokio::test]
    async fn canned_iq_responses() {
        let bus = MockBus::new();
        let peer: Jid = "hv@bus.local".parse().unwrap();

        assert!(bus.iq_get(&peer, "ns", "uri").await.is_err());

        bus.expect_iq(
            &peer,
            "ns",
            "uri",
            IqResponse::default().with_value("uri", "qemu+tcp://peer/system"),
        );
        let response = bus.iq_get(&peer, "ns", "uri").await.unwrap();
        assert_eq!(response.value("uri"), Some("qemu+tcp://peer/system"));
    }

    #[tokio::test]
    async fn trigger_feed_reaches_subscribers() {
        let bus = MockBus::new();
        let peer: Jid = "other@bus.local".parse().unwrap();

        let mut watch = bus.subscribe_trigger(&peer, "libvirt_run").await.unwrap();
        bus.feed_trigger(&peer, "libvirt_run", true);

        assert_eq!(watch.states.recv().await, Some(true));
    }
}
