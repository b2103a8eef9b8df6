//! The client-side contract with the messaging-bus library.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::jid::Jid;
use crate::presence::PresenceShow;
use crate::stanza::Reply;

/// A subscription to a remote trigger's state.
///
/// Dropping the receiver ends the subscription.
pub struct TriggerWatch {
    /// Delivered on every observed transition, true for "on".
    pub states: mpsc::UnboundedReceiver<bool>,
}

/// The answer to a peer IQ request, reduced to its typed fields.
#[derive(Debug, Clone, Default)]
pub struct IqResponse {
    /// Child-element text keyed by element name.
    pub values: HashMap<String, String>,
}

impl IqResponse {
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// What the agent needs from the bus session it lives on.
///
/// Implemented by the external bus library; `MockBus` provides a recording
/// in-memory implementation for tests.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publish this session's presence.
    async fn publish_presence(&self, show: PresenceShow, status: &str) -> Result<()>;

    /// Push a change notification on an event channel.
    async fn push_change(&self, channel: &str, event: &str) -> Result<()>;

    /// Publish the state of one of this agent's triggers.
    async fn publish_trigger(&self, name: &str, state: bool) -> Result<()>;

    /// Observe a remote agent's trigger.
    async fn subscribe_trigger(&self, target: &Jid, trigger: &str) -> Result<TriggerWatch>;

    /// Send a typed reply to a requester.
    async fn send_reply(&self, to: &Jid, reply: Reply) -> Result<()>;

    /// Send a typed get request to a peer and wait for its answer.
    async fn iq_get(&self, to: &Jid, ns: &str, action: &str) -> Result<IqResponse>;

    /// Broadcast a message to the agent's group chat.
    async fn group_message(&self, subject: &str, body: &str) -> Result<()>;

    /// Publish the agent's vCard (display name and optional avatar).
    async fn publish_vcard(&self, name: &str, avatar: Option<&str>) -> Result<()>;

    /// Close the bus session.
    async fn disconnect(&self) -> Result<()>;
}
