//! Ring metadata: the routing table every member shares.
//!
//! A `Metadata` snapshot lists every ring member, ordered by id, with the
//! range it owns. After every successful membership change the ranges must
//! tile the hash space: pairwise disjoint, and together covering all of it.

use crate::error::{Error, Result};
use crate::hash::HashKey;
use crate::node::NodeInfo;
use serde::Serialize;

/// An immutable routing snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    nodes: Vec<NodeInfo>,
}

impl Metadata {
    /// Build a snapshot from members in any order; they are sorted by id.
    pub fn new(mut nodes: Vec<NodeInfo>) -> Self {
        nodes.sort_by_key(|n| n.id);
        Self { nodes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn get(&self, id: HashKey) -> Option<&NodeInfo> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn contains(&self, id: HashKey) -> bool {
        self.index_of(id).is_some()
    }

    /// The member whose write range holds `key`.
    pub fn responsible_for(&self, key: HashKey) -> Option<&NodeInfo> {
        // Ranges end at the owner's id, so the owner is the first id >= key.
        if self.nodes.is_empty() {
            return None;
        }
        let idx = self.nodes.partition_point(|n| n.id < key);
        let owner = &self.nodes[idx % self.nodes.len()];
        owner.write_range.contains(key).then_some(owner)
    }

    /// The next member clockwise from `id`, if there is a distinct one.
    ///
    /// `id` does not need to be a member; a departing node uses this to find
    /// where its data now belongs.
    pub fn successor_of(&self, id: HashKey) -> Option<&NodeInfo> {
        let candidate = match self.nodes.iter().find(|n| n.id > id) {
            Some(n) => n,
            None => self.nodes.first()?,
        };
        (candidate.id != id).then_some(candidate)
    }

    /// The previous member counter-clockwise from `id`, if there is a distinct one.
    pub fn predecessor_of(&self, id: HashKey) -> Option<&NodeInfo> {
        let candidate = match self.nodes.iter().rev().find(|n| n.id < id) {
            Some(n) => n,
            None => self.nodes.last()?,
        };
        (candidate.id != id).then_some(candidate)
    }

    /// Check that the ranges tile the whole ring with no gap and no overlap.
    ///
    /// Sorted by id, each member must own exactly `(previous id, own id]`,
    /// and a lone member must own everything.
    pub fn validate(&self) -> Result<()> {
        let n = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 && self.nodes[i - 1].id == node.id {
                return Err(Error::Invariant(format!("duplicate member {}", node.id)));
            }
            if node.write_range.end != node.id {
                return Err(Error::Invariant(format!(
                    "member {} owns {} which does not end at its id",
                    node.id, node.write_range
                )));
            }
            let previous = &self.nodes[(i + n - 1) % n];
            if node.write_range.start != previous.id.next() {
                return Err(Error::Invariant(format!(
                    "member {} owns {} but its predecessor is {}",
                    node.id, node.write_range, previous.id
                )));
            }
        }
        Ok(())
    }

    fn index_of(&self, id: HashKey) -> Option<usize> {
        self.nodes.binary_search_by_key(&id, |n| n.id).ok()
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = &'a NodeInfo;
    type IntoIter = std::slice::Iter<'a, NodeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
