//! Bus addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// A bus address of the form `node@domain/resource`.
///
/// For a VM agent the node part is the VM's UUID; this invariant is enforced
/// by the agent, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build an address from node and domain parts.
    pub fn new(node: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            domain: domain.into(),
            resource: None,
        }
    }

    /// The node (local) part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Attach a resource part.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

impl FromStr for Jid {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BusError::InvalidJid("empty address".to_string()));
        }

        let (without_resource, resource) = match s.split_once('/') {
            Some((head, res)) if !res.is_empty() => (head, Some(res.to_string())),
            Some((head, _)) => (head, None),
            None => (s, None),
        };

        let (node, domain) = match without_resource.split_once('@') {
            Some((node, domain)) if !node.is_empty() => (Some(node.to_string()), domain),
            Some((_, domain)) => (None, domain),
            None => (None, without_resource),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(BusError::InvalidJid(s.to_string()));
        }

        Ok(Jid {
            node,
            domain: domain.to_string(),
            resource,
        })
    }
}

impl TryFrom<String> for Jid {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> String {
        jid.to_string()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address() {
        let jid: Jid = "5e031953-ddb6-4a0c-92d7-9e7ecfb6b461@bus.local/agent"
            .parse()
            .unwrap();
        assert_eq!(jid.node(), Some("5e031953-ddb6-4a0c-92d7-9e7ecfb6b461"));
        assert_eq!(jid.domain(), "bus.local");
        assert_eq!(jid.resource(), Some("agent"));
    }

    #[test]
    fn bare_drops_resource() {
        let jid: Jid = "vm@bus.local/agent".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "vm@bus.local");
    }

    #[test]
    fn domain_only_address() {
        let jid: Jid = "bus.local".parse().unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "bus.local");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Jid>().is_err());
        assert!("a@b@c".parse::<Jid>().is_err());
        assert!("node@".parse::<Jid>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for s in ["vm@bus.local", "vm@bus.local/agent", "bus.local"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }
}
