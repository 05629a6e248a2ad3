//! Kademlia routing table.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::bucket::Bucket;
use crate::contacts::Contacts;
use crate::node::Node;

#[derive(Debug)]
struct BucketSlot {
    bucket: Bucket,
    /// `None` until the bucket is refreshed for the first time.
    refreshed: Mutex<Option<Instant>>,
}

impl BucketSlot {
    fn new(k: usize, refreshed: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            bucket: Bucket::new(k),
            refreshed: Mutex::new(refreshed),
        })
    }
}

/// One k-bucket per bit of XOR distance from the local node.
///
/// The table starts with as many buckets as the local hash has bits and grows
/// when a peer with a wider hash shows up. A peer lives in bucket
/// `self.zero_prefix_len(peer)`; the local node itself is never stored.
///
/// Every bucket has its own lock, and the outer lock is only held long
/// enough to clone bucket handles, so operations on different buckets do not
/// contend.
#[derive(Debug)]
pub struct RoutingTable {
    self_node: Node,
    k: usize,
    buckets: RwLock<Vec<Arc<BucketSlot>>>,
}

impl RoutingTable {
    /// Create a routing table for `self_node` holding up to `k` peers per bucket.
    pub fn new(self_node: Node, k: usize) -> Self {
        let count = self_node.hash_bits().max(1);
        let buckets = (0..count).map(|_| BucketSlot::new(k, None)).collect();
        Self {
            self_node,
            k,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Bucket capacity.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Grow the bucket array so a `bits`-wide hash can be routed.
    fn ensure_width(&self, bits: usize) {
        if bits <= self.buckets.read().len() {
            return;
        }
        let mut buckets = self.buckets.write();
        let current = buckets.len();
        if bits <= current {
            return;
        }
        let now = Instant::now();
        buckets.extend((current..bits).map(|_| BucketSlot::new(self.k, Some(now))));
        debug!(from = current, to = bits, "routing table grew");
    }

    fn bucket_index(&self, node: &Node) -> usize {
        self.self_node.zero_prefix_len(node)
    }

    fn slot(&self, idx: usize) -> Option<Arc<BucketSlot>> {
        self.buckets.read().get(idx).cloned()
    }

    fn slot_for(&self, node: &Node) -> Option<Arc<BucketSlot>> {
        self.ensure_width(node.hash_bits());
        self.slot(self.bucket_index(node))
    }

    /// Record that `node` was seen. Returns the peer evicted to make room, if any.
    pub fn update(&self, node: Node) -> Option<Node> {
        if !node.is_valid() || node == self.self_node {
            return None;
        }
        let slot = self.slot_for(&node)?;
        let evicted = slot.bucket.update(node);
        if let Some(old) = &evicted {
            trace!(peer = %old, "evicted least recently seen peer");
        }
        evicted
    }

    /// Forget `node`. Returns true if it was present.
    pub fn remove(&self, node: &Node) -> bool {
        if !node.is_valid() {
            return false;
        }
        match self.slot_for(node) {
            Some(slot) => slot.bucket.remove(node),
            None => false,
        }
    }

    pub fn contains(&self, node: &Node) -> bool {
        if !node.is_valid() {
            return false;
        }
        let idx = self.bucket_index(node);
        self.slot(idx)
            .map(|slot| slot.bucket.contains(node))
            .unwrap_or(false)
    }

    /// Up to `n` known peers near `target`, nearest first, skipping `excluded`.
    ///
    /// `n == 0` means `k`. Buckets are scanned from `d =
    /// zero_prefix_len(self, target)` down to 0, then from `d + 1` upward,
    /// until `n` candidates have been collected.
    pub fn kclosest(&self, n: usize, target: &Node, excluded: &[Node]) -> Vec<Node> {
        let n = if n == 0 { self.k } else { n };
        let buckets: Vec<Arc<BucketSlot>> = self.buckets.read().clone();
        if buckets.is_empty() {
            return Vec::new();
        }
        let contacts = Contacts::new(target.clone(), excluded);
        let d = self.bucket_index(target).min(buckets.len() - 1);

        let order = (0..=d).rev().chain(d + 1..buckets.len());
        for idx in order {
            if contacts.len() >= n {
                break;
            }
            for node in buckets[idx].bucket.iter() {
                if contacts.append(node) && contacts.len() >= n {
                    break;
                }
            }
        }

        contacts.sort();
        contacts.into_nodes()
    }

    /// Total number of peers.
    pub fn size(&self) -> usize {
        self.buckets.read().iter().map(|slot| slot.bucket.len()).sum()
    }

    /// Indices of buckets not refreshed within `interval` (or never).
    pub fn buckets_needed_for_refresh(&self, interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .read()
            .iter()
            .enumerate()
            .filter(|(_, slot)| match *slot.refreshed.lock() {
                Some(at) => now.duration_since(at) >= interval,
                None => true,
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Some member of bucket `idx`; the most recently seen one.
    pub fn random_node_from_bucket(&self, idx: usize) -> Option<Node> {
        self.slot(idx)?.bucket.iter().next()
    }

    pub fn mark_bucket_refreshed(&self, idx: usize) {
        if let Some(slot) = self.slot(idx) {
            *slot.refreshed.lock() = Some(Instant::now());
        }
    }

    /// Number of peers in bucket `idx`.
    pub fn bucket_len(&self, idx: usize) -> usize {
        self.slot(idx).map(|slot| slot.bucket.len()).unwrap_or(0)
    }
}
