//! Free-form chat surface.
//!
//! Maps chat phrases to agent actions. The dispatch applies the same
//! permission and gate checks as the typed router, so both surfaces behave
//! identically.

use tracing::info;
use volary_bus::Jid;

use crate::vm::VirtualMachine;

/// Actions reachable from chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    Create,
    Shutdown,
    Destroy,
    Suspend,
    Resume,
    Info,
    XmlDesc,
    NetworkInfo,
    Hello,
    Insult,
}

impl ChatAction {
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            ChatAction::Create
                | ChatAction::Shutdown
                | ChatAction::Destroy
                | ChatAction::Suspend
                | ChatAction::Resume
        )
    }
}

/// One registrar row: phrases, the action they trigger, the permission that
/// guards it and the help text (`None` hides the entry from help).
pub struct VocabularyEntry {
    pub phrases: &'static [&'static str],
    pub action: ChatAction,
    pub permission: Option<&'static str>,
    pub description: Option<&'static str>,
}

/// The registration table handed to the external vocabulary registrar.
pub fn vocabulary() -> &'static [VocabularyEntry] {
    const TABLE: &[VocabularyEntry] = &[
        VocabularyEntry {
            phrases: &["start", "create", "boot", "play", "run"],
            action: ChatAction::Create,
            permission: Some("create"),
            description: Some("I'll start"),
        },
        VocabularyEntry {
            phrases: &["shutdown", "stop"],
            action: ChatAction::Shutdown,
            permission: Some("shutdown"),
            description: Some("I'll shutdown"),
        },
        VocabularyEntry {
            phrases: &["destroy"],
            action: ChatAction::Destroy,
            permission: Some("destroy"),
            description: Some("I'll destroy myself"),
        },
        VocabularyEntry {
            phrases: &["pause", "suspend"],
            action: ChatAction::Suspend,
            permission: Some("suspend"),
            description: Some("I'll suspend"),
        },
        VocabularyEntry {
            phrases: &["resume", "unpause"],
            action: ChatAction::Resume,
            permission: Some("resume"),
            description: Some("I'll resume"),
        },
        VocabularyEntry {
            phrases: &["info", "how are you", "and you"],
            action: ChatAction::Info,
            permission: Some("info"),
            description: Some("I'll give info about me"),
        },
        VocabularyEntry {
            phrases: &["desc", "xml"],
            action: ChatAction::XmlDesc,
            permission: None,
            description: Some("I'll show my description"),
        },
        VocabularyEntry {
            phrases: &["net", "stat"],
            action: ChatAction::NetworkInfo,
            permission: Some("networkinfo"),
            description: Some("I'll show my network stats"),
        },
        VocabularyEntry {
            phrases: &["hello", "hey", "hi", "good morning", "yo"],
            action: ChatAction::Hello,
            permission: None,
            description: None,
        },
        VocabularyEntry {
            phrases: &["fuck", "asshole", "jerk", "stupid", "suck"],
            action: ChatAction::Insult,
            permission: None,
            description: None,
        },
    ];
    TABLE
}

/// Resolve a chat line to its entry; the longest matching phrase wins.
pub fn resolve(text: &str) -> Option<&'static VocabularyEntry> {
    let lower = text.trim().to_lowercase();
    vocabulary()
        .iter()
        .flat_map(|entry| entry.phrases.iter().map(move |phrase| (*phrase, entry)))
        .filter(|(phrase, _)| {
            lower == *phrase || lower.starts_with(&format!("{} ", phrase))
        })
        .max_by_key(|(phrase, _)| phrase.len())
        .map(|(_, entry)| entry)
}

impl VirtualMachine {
    /// Handle one chat line. `None` when no phrase matches (the entity layer
    /// answers with its own fallback).
    pub async fn handle_chat(&self, from: &Jid, text: &str) -> Option<String> {
        let entry = resolve(text)?;
        info!(from = %from, action = ?entry.action, "chat command");

        if let Some(permission) = entry.permission {
            if !self.permissions.check(&from.bare().to_string(), permission) {
                return Some("You are not authorized to ask that.".to_string());
            }
        }
        if entry.action.is_mutating() && self.is_migrating().await {
            return Some("I am migrating right now, ask me again later.".to_string());
        }

        Some(match entry.action {
            ChatAction::Create
            | ChatAction::Shutdown
            | ChatAction::Destroy
            | ChatAction::Suspend
            | ChatAction::Resume => self.chat_mutation(entry.action).await,
            ChatAction::Info => match self.info().await {
                Ok(info) => {
                    let states = [
                        "no state",
                        "running",
                        "blocked",
                        "paused",
                        "shutdowned",
                        "shut off",
                        "crashed",
                    ];
                    let state = states.get(info.state as usize).copied().unwrap_or("unknown");
                    let cpu_word = if info.nr_virt_cpu < 2 { "CPU" } else { "CPUs" };
                    format!(
                        "I'm in state {}, I use {} Mo of memory. I've got {} {} and I've \
                         consumed {} second of my hypervisor ({})",
                        state,
                        info.memory / 1024,
                        info.nr_virt_cpu,
                        cpu_word,
                        info.cpu_time / 1_000_000_000,
                        info.hypervisor_jid
                    )
                }
                Err(e) => format!("Error: {}", e),
            },
            ChatAction::XmlDesc => match self.xmldesc().await {
                Ok(document) => document,
                Err(e) => format!("Error: {}", e),
            },
            ChatAction::NetworkInfo => match self.network_info().await {
                Ok(interfaces) => {
                    let mut response = String::from("My network info are:\n");
                    for (name, s) in interfaces {
                        response.push_str(&format!(
                            "{}: rx_bytes:{} rx_packets:{} rx_errs:{} rx_drop:{} / \
                             tx_bytes:{} tx_packets:{} tx_errs:{} tx_drop:{}\n",
                            name,
                            s.rx_bytes,
                            s.rx_packets,
                            s.rx_errs,
                            s.rx_drop,
                            s.tx_bytes,
                            s.tx_packets,
                            s.tx_errs,
                            s.tx_drop
                        ));
                    }
                    response
                }
                Err(e) => format!("Error: {}", e),
            },
            ChatAction::Hello => format!(
                "Hello {}! How are you today?",
                from.node().unwrap_or("you")
            ),
            ChatAction::Insult => {
                "Please, don't be so rude with me, I try to do my best everyday for you."
                    .to_string()
            }
        })
    }

    async fn chat_mutation(&self, action: ChatAction) -> String {
        if !self.lock.try_lock() {
            return "I am locked right now, ask me again later.".to_string();
        }
        let result = match action {
            ChatAction::Create => self.create().await.map(|_| ()),
            ChatAction::Shutdown => self.shutdown_domain().await,
            ChatAction::Destroy => self.destroy_domain().await,
            ChatAction::Suspend => self.suspend_domain().await,
            ChatAction::Resume => self.resume_domain().await,
            _ => unreachable!("not a mutation"),
        };
        match result {
            Ok(()) => match action {
                ChatAction::Create => "I'm starting".to_string(),
                ChatAction::Shutdown => "I'm shutdowning".to_string(),
                ChatAction::Destroy => "I've destroyed myself".to_string(),
                ChatAction::Suspend => "I'm suspended".to_string(),
                ChatAction::Resume => "I'm resumed".to_string(),
                _ => unreachable!(),
            },
            Err(e) => {
                self.lock.unlock();
                format!("Error: {}", e)
            }
        }
    }
}
