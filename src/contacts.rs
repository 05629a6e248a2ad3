//! Per-lookup candidate set.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::node::Node;

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<Node>,
    /// id -> position in `nodes`.
    index: HashMap<Vec<u8>, usize>,
}

/// Deduplicated list of nodes that can be ordered by distance to a
/// comparator.
///
/// A lookup builds one of these, appends every node it hears about, and
/// calls [`sort`](Self::sort) before handing the result out. Nodes on the
/// blacklist are never accepted.
#[derive(Debug)]
pub struct Contacts {
    comparator: Node,
    blacklist: HashSet<Vec<u8>>,
    inner: RwLock<Inner>,
}

impl Contacts {
    pub fn new(comparator: Node, blacklist: &[Node]) -> Self {
        Self {
            comparator,
            blacklist: blacklist.iter().map(|n| n.id.clone()).collect(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn comparator(&self) -> &Node {
        &self.comparator
    }

    /// Append a node. Returns false if it is blacklisted or already present.
    pub fn append(&self, node: Node) -> bool {
        if self.blacklist.contains(&node.id) {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.index.contains_key(&node.id) {
            return false;
        }
        let pos = inner.nodes.len();
        inner.index.insert(node.id.clone(), pos);
        inner.nodes.push(node);
        true
    }

    /// Remove a node. Returns true if it was present.
    pub fn remove(&self, node: &Node) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.index.remove(&node.id) else {
            return false;
        };
        inner.nodes.remove(pos);
        for idx in inner.index.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        true
    }

    pub fn index_of(&self, node: &Node) -> Option<usize> {
        self.inner.read().index.get(&node.id).copied()
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.inner.read().index.contains_key(&node.id)
    }

    /// Stable ascending sort by distance to the comparator.
    pub fn sort(&self) {
        let mut inner = self.inner.write();
        if inner.nodes.len() < 2 {
            return;
        }
        let comparator = &self.comparator;
        inner
            .nodes
            .sort_by_cached_key(|node| node.distance_between(comparator));
        let Inner { nodes, index } = &mut *inner;
        for (pos, node) in nodes.iter().enumerate() {
            index.insert(node.id.clone(), pos);
        }
    }

    /// Keep only the first `len` nodes.
    pub fn truncate(&self, len: usize) {
        let mut inner = self.inner.write();
        if inner.nodes.len() <= len {
            return;
        }
        let dropped: Vec<Node> = inner.nodes.drain(len..).collect();
        for node in dropped {
            inner.index.remove(&node.id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<Node> {
        self.inner.read().nodes.get(pos).cloned()
    }

    pub fn first(&self) -> Option<Node> {
        self.get(0)
    }

    /// Copy of the current list in its current order.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.clone()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.inner.into_inner().nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> Node {
        let mut hash = vec![0u8; 32];
        hash[0] = i;
        Node::new(vec![i], hash)
    }

    #[test]
    fn append_rejects_duplicates_and_blacklisted() {
        let blocked = node(9);
        let contacts = Contacts::new(node(0), std::slice::from_ref(&blocked));
        assert!(contacts.append(node(1)));
        assert!(!contacts.append(node(1)));
        assert_eq!(contacts.len(), 1);
        assert!(!contacts.append(blocked));
        assert_eq!(contacts.len(), 1);
    }

    #[test]
    fn remove_fixes_up_later_indices() {
        let contacts = Contacts::new(node(0), &[]);
        for i in 1..=4 {
            contacts.append(node(i));
        }
        assert!(contacts.remove(&node(2)));
        assert!(!contacts.remove(&node(2)));
        assert_eq!(contacts.index_of(&node(1)), Some(0));
        assert_eq!(contacts.index_of(&node(3)), Some(1));
        assert_eq!(contacts.index_of(&node(4)), Some(2));
        assert_eq!(contacts.index_of(&node(2)), None);
    }

    #[test]
    fn sort_orders_by_distance_to_comparator() {
        let contacts = Contacts::new(node(0x18), &[]);
        for i in [0x20, 0x10, 0x08, 0x19] {
            contacts.append(node(i));
        }
        contacts.sort();
        let ids: Vec<u8> = contacts.nodes().iter().map(|n| n.id[0]).collect();
        assert_eq!(ids, vec![0x19, 0x10, 0x08, 0x20]);
        assert_eq!(contacts.index_of(&node(0x20)), Some(3));

        let comparator = contacts.comparator().clone();
        let nodes = contacts.nodes();
        for pair in nodes.windows(2) {
            assert!(
                pair[0].distance_between(&comparator) <= pair[1].distance_between(&comparator)
            );
        }
    }

    #[test]
    fn truncate_keeps_index_consistent() {
        let contacts = Contacts::new(node(0), &[]);
        for i in 1..=5 {
            contacts.append(node(i));
        }
        contacts.truncate(2);
        assert_eq!(contacts.len(), 2);
        assert!(!contacts.contains(&node(5)));
        assert!(contacts.append(node(5)));
    }
}
