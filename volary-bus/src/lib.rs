//! # Volary Bus
//!
//! Messaging-bus boundary for the per-VM control agent.
//!
//! The actual bus client library (connection, authentication, stanza
//! serialization) lives outside this workspace. This crate defines what the
//! agent needs from it: addresses, typed request/reply envelopes, presence
//! shows, the `BusClient` trait, and a recording `MockBus` for tests.

pub mod client;
pub mod error;
pub mod jid;
pub mod mock;
pub mod presence;
pub mod stanza;

pub use client::{BusClient, IqResponse, TriggerWatch};
pub use error::{BusError, Result};
pub use jid::Jid;
pub use mock::MockBus;
pub use presence::PresenceShow;
pub use stanza::{InfoPayload, NetworkPayload, Reply, ReplyPayload, Request, WireError};
