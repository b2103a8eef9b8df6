//! Presence shows published on the bus.

use serde::{Deserialize, Serialize};

/// The availability component of a presence.
///
/// `as_str` yields the protocol encoding, where plain availability is the
/// empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceShow {
    Available,
    Away,
    ExtendedAway,
    DoNotDisturb,
}

impl PresenceShow {
    /// Protocol encoding of the show value.
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceShow::Available => "",
            PresenceShow::Away => "away",
            PresenceShow::ExtendedAway => "xa",
            PresenceShow::DoNotDisturb => "dnd",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encodings() {
        assert_eq!(PresenceShow::Available.as_str(), "");
        assert_eq!(PresenceShow::Away.as_str(), "away");
        assert_eq!(PresenceShow::ExtendedAway.as_str(), "xa");
        assert_eq!(PresenceShow::DoNotDisturb.as_str(), "dnd");
    }
}
