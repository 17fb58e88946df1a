//! Ring topology: the ordered membership structure.
//!
//! Members are kept in a `BTreeMap` keyed by their hash key. Neighbor lookups
//! use ceiling/floor range queries and fall back to the first/last entry to
//! wrap around, so there is no circular linked structure to maintain.
//!
//! # Performance Characteristics
//!
//! - **add/remove**: O(log n), plus invalidating the metadata cache
//! - **successor/predecessor**: O(log n)
//! - **metadata**: O(n) on the first call after a change, O(1) afterwards

use crate::error::{Error, Result};
use crate::hash::HashKey;
use crate::metadata::Metadata;
use crate::node::NodeDescriptor;
use crate::range::KeyHashRange;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

/// Sorted ring membership plus a lazily rebuilt metadata snapshot.
#[derive(Debug, Default)]
pub struct RingTopology {
    nodes: BTreeMap<HashKey, NodeDescriptor>,
    /// `None` whenever membership changed since the last snapshot.
    cache: Mutex<Option<Arc<Metadata>>>,
}

impl RingTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member.
    ///
    /// Fails if a member with the same hash key is already present. On
    /// success, returns the member's successor: the node that must hand over
    /// part of its range. `None` means the new node is alone.
    pub fn add(&mut self, node: NodeDescriptor) -> Result<Option<NodeDescriptor>> {
        let key = node.hash_key();
        if let Some(existing) = self.nodes.get(&key) {
            return Err(Error::RingOperation(format!(
                "{} collides with member {} at {}",
                node, existing, key
            )));
        }
        self.nodes.insert(key, node);
        self.invalidate();
        Ok(self.successor(key))
    }

    /// Remove the member at `key`.
    ///
    /// Returns the member that inherits the freed range, or `None` if the
    /// ring is now empty.
    pub fn remove(&mut self, key: HashKey) -> Result<Option<NodeDescriptor>> {
        if self.nodes.remove(&key).is_none() {
            return Err(Error::RingOperation(format!("no member at {}", key)));
        }
        self.invalidate();
        Ok(self.ceiling_exclusive(key).cloned())
    }

    pub fn get(&self, key: HashKey) -> Option<&NodeDescriptor> {
        self.nodes.get(&key)
    }

    pub fn contains(&self, key: HashKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in ring order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// The next member clockwise from `key`.
    ///
    /// Returns `None` when the ring has fewer than two members.
    pub fn successor(&self, key: HashKey) -> Option<NodeDescriptor> {
        if self.nodes.len() < 2 {
            return None;
        }
        self.ceiling_exclusive(key).cloned()
    }

    /// The previous member counter-clockwise from `key`.
    ///
    /// Returns `None` when the ring has fewer than two members.
    pub fn predecessor(&self, key: HashKey) -> Option<NodeDescriptor> {
        if self.nodes.len() < 2 {
            return None;
        }
        self.nodes
            .range(..key)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(_, node)| node.clone())
    }

    /// The range the member at `key` currently owns.
    pub fn range_of(&self, key: HashKey) -> Option<KeyHashRange> {
        if !self.nodes.contains_key(&key) {
            return None;
        }
        let previous = self
            .nodes
            .range(..key)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(k, _)| *k)?;
        Some(KeyHashRange::owned_by(previous, key))
    }

    /// Current metadata snapshot, rebuilt if membership changed.
    ///
    /// Each member owns `(predecessor, own]`; the first member's range wraps
    /// from the last member's key.
    pub fn metadata(&self) -> Arc<Metadata> {
        let mut cache = self.cache.lock();
        if let Some(metadata) = cache.as_ref() {
            return Arc::clone(metadata);
        }
        let Some(last) = self.nodes.keys().next_back().copied() else {
            let empty = Arc::new(Metadata::empty());
            *cache = Some(Arc::clone(&empty));
            return empty;
        };
        let mut previous = last;
        let mut members = Vec::with_capacity(self.nodes.len());
        for (key, node) in &self.nodes {
            members.push(node.with_range(KeyHashRange::owned_by(previous, *key)));
            previous = *key;
        }
        let metadata = Arc::new(Metadata::new(members));
        *cache = Some(Arc::clone(&metadata));
        metadata
    }

    /// First member strictly after `key`, wrapping to the first member.
    fn ceiling_exclusive(&self, key: HashKey) -> Option<&NodeDescriptor> {
        self.nodes
            .range((Excluded(key), Unbounded))
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, node)| node)
    }

    fn invalidate(&mut self) {
        *self.cache.get_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node(port: u16) -> NodeDescriptor {
        NodeDescriptor::new(format!("node{}", port), Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_metadata_cache_is_invalidated() {
        let mut ring = RingTopology::new();
        ring.add(node(5000)).unwrap();
        let first = ring.metadata();
        assert!(Arc::ptr_eq(&first, &ring.metadata()));

        ring.add(node(5001)).unwrap();
        let second = ring.metadata();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_range_of_matches_metadata() {
        let mut ring = RingTopology::new();
        for port in 5000..5005 {
            ring.add(node(port)).unwrap();
        }
        let metadata = ring.metadata();
        for member in metadata.iter() {
            assert_eq!(ring.range_of(member.id), Some(member.write_range));
        }
        assert_eq!(ring.range_of(HashKey(7)), None);
    }
}
