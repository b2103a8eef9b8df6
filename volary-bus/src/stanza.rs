//! Typed request and reply envelopes.
//!
//! These are the in-process form of the bus stanzas. The external bus
//! library translates between this shape and the wire; the agent only ever
//! sees these types.

use serde::{Deserialize, Serialize};

use crate::jid::Jid;

/// An inbound typed request addressed to the agent.
///
/// The action is carried as a string and resolved by the receiver; an
/// unknown action is ignored rather than answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Stanza id, echoed in the reply.
    pub id: String,
    /// Sender address.
    pub from: Jid,
    /// Request namespace.
    pub ns: String,
    /// Action name from the request envelope.
    pub action: String,
    /// Integer argument (autostart, memory, setvcpus).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    /// Target hypervisor address (migrate).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor_jid: Option<String>,
    /// Domain XML payload (define).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_xml: Option<String>,
}

impl Request {
    pub fn new(from: Jid, ns: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: format!("rq-{}", next_id()),
            from,
            ns: ns.into(),
            action: action.into(),
            value: None,
            hypervisor_jid: None,
            domain_xml: None,
        }
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_hypervisor_jid(mut self, jid: impl Into<String>) -> Self {
        self.hypervisor_jid = Some(jid.into());
        self
    }

    pub fn with_domain_xml(mut self, xml: impl Into<String>) -> Self {
        self.domain_xml = Some(xml.into());
        self
    }
}

/// Process-local monotonic id, good enough for stanza ids in tests.
fn next_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A typed error carried by an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Numeric error code from the stable set, or a driver's native code.
    pub code: i32,
    /// Error namespace; set when the code belongs to the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    /// Human-readable message.
    pub text: String,
}

impl WireError {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            ns: None,
            text: text.into(),
        }
    }

    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }
}

/// Payload of the `info` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPayload {
    pub state: u8,
    pub max_mem: u64,
    pub memory: u64,
    pub nr_virt_cpu: u32,
    pub cpu_time: u64,
    pub hypervisor_jid: String,
    pub autostart: u8,
}

/// One interface entry of the `networkinfo` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPayload {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Action-specific payloads of result replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ReplyPayload {
    None,
    /// `create` result: the hypervisor-assigned domain id.
    Domain { id: i32 },
    Info(InfoPayload),
    /// A domain XML document (`xmldesc`).
    Xml { document: String },
    /// Interface counters keyed by alias name (`networkinfo`).
    Networks { interfaces: Vec<(String, NetworkPayload)> },
    /// The hypervisor capabilities document.
    Capabilities { document: String },
}

/// An outbound typed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Reply {
    Result { id: String, payload: ReplyPayload },
    /// Positive acknowledgement with intentionally no content.
    Ignore { id: String },
    Error { id: String, error: WireError },
}

impl Reply {
    pub fn result(request: &Request, payload: ReplyPayload) -> Self {
        Reply::Result {
            id: request.id.clone(),
            payload,
        }
    }

    pub fn ignore(request: &Request) -> Self {
        Reply::Ignore {
            id: request.id.clone(),
        }
    }

    pub fn error(request: &Request, error: WireError) -> Self {
        Reply::Error {
            id: request.id.clone(),
            error,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Reply::Result { id, .. } | Reply::Ignore { id } | Reply::Error { id, .. } => id,
        }
    }

    /// The wire error, when this is an error reply.
    pub fn wire_error(&self) -> Option<&WireError> {
        match self {
            Reply::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}
