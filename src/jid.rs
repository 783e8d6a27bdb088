//! JID (Jabber ID) value type: `node@domain/resource`.
//!
//! The routing table keys on full JIDs and indexes on bare JIDs, so `Jid`
//! is cheap to clone, hash and compare. Normalization is limited to
//! ASCII-lowercasing the node and domain (resources are case-sensitive
//! per RFC 6120); full stringprep is out of scope for this core.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.map(|n| n.to_ascii_lowercase()),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(|r| r.to_string()),
        }
    }

    /// Parse `node@domain/resource`, with node and resource optional.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::MalformedJid(text.to_string()));
        }

        // Resource is everything after the first '/', which may itself
        // contain further slashes.
        let (addr, resource) = match trimmed.split_once('/') {
            Some((addr, resource)) if !resource.is_empty() => (addr, Some(resource)),
            Some((_, _)) => return Err(Error::MalformedJid(text.to_string())),
            None => (trimmed, None),
        };

        let (node, domain) = match addr.rsplit_once('@') {
            Some((node, domain)) if !node.is_empty() && !domain.is_empty() => {
                (Some(node), domain)
            }
            Some((_, _)) => return Err(Error::MalformedJid(text.to_string())),
            None => (None, addr),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(Error::MalformedJid(text.to_string()));
        }

        Ok(Self::new(node, domain, resource))
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource part.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// A destination is unusable for direct delivery when it names neither
    /// a node nor a resource (a bare domain).
    pub fn is_domain_only(&self) -> bool {
        self.node.is_none() && self.resource.is_none()
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
    fn test_parse_full_jid() {
        let jid = Jid::parse("alice@example.com/desktop").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("desktop"));
        assert!(jid.is_full());
    }

    #[test]
    fn test_parse_bare_jid() {
        let jid = Jid::parse("alice@example.com").unwrap();
        assert!(jid.is_bare());
        assert_eq!(jid.to_string(), "alice@example.com");
    }

    #[test]
    fn test_parse_domain_only() {
        let jid = Jid::parse("example.com").unwrap();
        assert!(jid.is_domain_only());
        assert_eq!(jid.domain(), "example.com");
    }

    #[test]
    fn test_node_and_domain_are_lowercased() {
        let jid = Jid::parse("Alice@Example.COM/Desktop").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        // Resources stay case-sensitive
        assert_eq!(jid.resource(), Some("Desktop"));
    }

    #[test]
    fn test_bare_strips_resource() {
        let jid = Jid::parse("alice@example.com/desktop").unwrap();
        let bare = jid.to_bare();
        assert!(bare.is_bare());
        assert_eq!(bare.to_string(), "alice@example.com");
        // Equal bare JIDs from different full JIDs compare equal
        let other = Jid::parse("alice@example.com/mobile").unwrap();
        assert_eq!(bare, other.to_bare());
    }

    #[test]
    fn test_resource_may_contain_slashes() {
        let jid = Jid::parse("alice@example.com/work/laptop").unwrap();
        assert_eq!(jid.resource(), Some("work/laptop"));
    }

    #[test]
    fn test_malformed_jids_rejected() {
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("@example.com").is_err());
        assert!(Jid::parse("alice@").is_err());
        assert!(Jid::parse("alice@example.com/").is_err());
    }

    #[test]
    fn test_at_in_node_uses_last_separator() {
        let jid = Jid::parse("a@b@example.com").unwrap();
        assert_eq!(jid.node(), Some("a@b"));
        assert_eq!(jid.domain(), "example.com");
    }
}
