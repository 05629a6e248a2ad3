//! A single Kademlia k-bucket.

use parking_lot::RwLock;

use crate::node::Node;

/// Fixed-capacity set of peers ordered by recency.
///
/// Slots are numbered `0..cap()`. Occupied slots are packed toward the
/// high end, so slot `cap() - 1` always holds the most recently seen peer
/// and free slots sit at the low end:
///
/// ```text
/// [ ][ ][ ][a][b][c]
///  ^               ^
///  free            most recently seen
/// ```
#[derive(Debug)]
pub struct Bucket {
    capacity: usize,
    /// Least recently seen first.
    nodes: RwLock<Vec<Node>>,
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Mark `node` as the most recently seen peer.
    ///
    /// A known peer moves to the MRU end (its descriptor is replaced, so new
    /// addresses are picked up). An unknown peer is appended; when the bucket
    /// is full the least recently seen peer is evicted and returned.
    pub fn update(&self, node: Node) -> Option<Node> {
        if !node.is_valid() || self.capacity == 0 {
            return None;
        }
        let mut nodes = self.nodes.write();
        if let Some(pos) = nodes.iter().position(|n| *n == node) {
            nodes.remove(pos);
            nodes.push(node);
            return None;
        }
        let evicted = if nodes.len() >= self.capacity {
            Some(nodes.remove(0))
        } else {
            None
        };
        nodes.push(node);
        evicted
    }

    /// Remove a peer by id. Returns true if it was present.
    pub fn remove(&self, node: &Node) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.iter().position(|n| n == node) {
            Some(pos) => {
                nodes.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        self.nodes.write().clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.read().iter().any(|n| n == node)
    }

    /// The peer in slot `index`, or `None` for a free or out-of-range slot.
    pub fn at(&self, index: usize) -> Option<Node> {
        let nodes = self.nodes.read();
        let free = self.capacity.checked_sub(nodes.len())?;
        if index >= self.capacity || index < free {
            return None;
        }
        nodes.get(index - free).cloned()
    }

    /// Copy of the members, most recently seen first.
    ///
    /// Taken under the read lock, so the result is consistent even if the
    /// bucket is mutated while the caller walks it.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().iter().rev().cloned().collect()
    }

    /// Iterate over a [`snapshot`](Self::snapshot).
    pub fn iter(&self) -> std::vec::IntoIter<Node> {
        self.snapshot().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> Node {
        Node::new(vec![i], vec![i; 32])
    }

    #[test]
    fn filling_to_capacity_then_one_more_evicts_oldest() {
        let bucket = Bucket::new(4);
        for i in 1..=4 {
            assert!(bucket.update(node(i)).is_none());
        }
        assert_eq!(bucket.len(), 4);

        let evicted = bucket.update(node(5));
        assert_eq!(evicted, Some(node(1)));
        assert_eq!(bucket.len(), 4);
        assert!(!bucket.contains(&node(1)));
        assert_eq!(bucket.at(3), Some(node(5)));
    }

    #[test]
    fn update_existing_moves_to_most_recent() {
        let bucket = Bucket::new(4);
        for i in 1..=3 {
            bucket.update(node(i));
        }
        bucket.update(node(1));
        assert_eq!(bucket.len(), 3);
        let order: Vec<u8> = bucket.iter().map(|n| n.id[0]).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn slots_are_packed_toward_most_recent_end() {
        let bucket = Bucket::new(4);
        bucket.update(node(1));
        bucket.update(node(2));
        assert_eq!(bucket.at(0), None);
        assert_eq!(bucket.at(1), None);
        assert_eq!(bucket.at(2), Some(node(1)));
        assert_eq!(bucket.at(3), Some(node(2)));
        assert_eq!(bucket.at(4), None);

        assert!(bucket.remove(&node(2)));
        assert_eq!(bucket.at(3), Some(node(1)));
        assert!(!bucket.remove(&node(2)));
    }

    #[test]
    fn invalid_nodes_are_ignored() {
        let bucket = Bucket::new(2);
        bucket.update(Node::new(Vec::new(), vec![1u8; 32]));
        assert!(bucket.is_empty());
    }

    #[test]
    fn remove_all_empties_bucket() {
        let bucket = Bucket::new(3);
        bucket.update(node(1));
        bucket.update(node(2));
        bucket.remove_all();
        assert_eq!(bucket.len(), 0);
        assert_eq!(bucket.cap(), 3);
    }
}
