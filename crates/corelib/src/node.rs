//! Node abstractions for the ring.
//!
//! A `NodeDescriptor` is a provisioned machine that may or may not be part of
//! the ring. A `NodeInfo` is a ring member as every other member sees it: its
//! address and the range it currently owns for writes.

use crate::hash::HashKey;
use crate::range::KeyHashRange;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A provisioned node, identified by name and reachable at `host:port`.
///
/// Keep this struct small and cheap to clone; connections and other heavy
/// state live with the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NodeDescriptor {
    /// Human-readable name from the pool configuration.
    pub name: String,
    pub host: Ipv4Addr,
    pub port: u16,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, host: Ipv4Addr, port: u16) -> Self {
        Self {
            name: name.into(),
            host,
            port,
        }
    }

    /// Ring position derived from the service address.
    pub fn hash_key(&self) -> HashKey {
        HashKey::for_address(self.host, self.port)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }

    /// Describe this node as a ring member owning `write_range`.
    pub fn with_range(&self, write_range: KeyHashRange) -> NodeInfo {
        NodeInfo::new(self.host, self.port, write_range)
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// A ring member: address plus owned write range.
///
/// Immutable after construction. Ranges change by building a new snapshot,
/// never by editing one in place.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NodeInfo {
    /// Always `HashKey::for_address(host, port)`.
    pub id: HashKey,
    pub host: Ipv4Addr,
    pub port: u16,
    pub write_range: KeyHashRange,
}

impl NodeInfo {
    pub fn new(host: Ipv4Addr, port: u16, write_range: KeyHashRange) -> Self {
        Self {
            id: HashKey::for_address(host, port),
            host,
            port,
            write_range,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }

    /// True when this node owns writes for `key`.
    pub fn is_responsible_for(&self, key: HashKey) -> bool {
        self.write_range.contains(key)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.host, self.port, self.write_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_and_info_share_id() {
        let desc = NodeDescriptor::new("node1", Ipv4Addr::LOCALHOST, 5000);
        let info = desc.with_range(KeyHashRange::full());
        assert_eq!(desc.hash_key(), info.id);
        assert_eq!(desc.addr(), info.addr());
        assert_eq!(desc.to_string(), "node1@127.0.0.1:5000");
    }

    #[test]
    fn test_responsibility_follows_range() {
        let range = KeyHashRange::new(HashKey(10), HashKey(20));
        let info = NodeInfo::new(Ipv4Addr::LOCALHOST, 5000, range);
        assert!(info.is_responsible_for(HashKey(15)));
        assert!(!info.is_responsible_for(HashKey(25)));
    }
}
