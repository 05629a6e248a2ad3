#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::time::{sleep, Duration, Instant};

use kad_sdht::{
    DhtConfig, HashAlgorithm, Kademlia, MemoryNetwork, MemoryStore, MemoryTransport, Node,
};

pub type TestNode = Arc<Kademlia<MemoryTransport>>;

/// A node whose identity is the given label.
pub fn node(label: &str) -> Node {
    Node::from_public_key(HashAlgorithm::Blake3, label.as_bytes())
}

/// Deterministic random nodes with 256-bit hashes.
pub fn random_nodes(seed: u64, count: usize) -> Vec<Node> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut key = [0u8; 32];
            rng.fill_bytes(&mut key);
            Node::from_public_key(HashAlgorithm::Blake3, &key)
        })
        .collect()
}

/// Timeouts short enough for tests, maintenance effectively off.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_millis(200),
        tick_interval: Duration::from_secs(3600),
        ..DhtConfig::default()
    }
}

pub struct TestNetwork {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<TestNode>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Add a node with a fresh in-memory store.
    pub fn spawn(&mut self, label: &str, config: DhtConfig) -> TestNode {
        self.spawn_with(node(label), config)
    }

    /// Add a node with an explicit descriptor.
    pub fn spawn_with(&mut self, me: Node, config: DhtConfig) -> TestNode {
        let transport = Arc::new(self.network.register(&me));
        let dht = Kademlia::spawn(me, Arc::new(MemoryStore::new()), transport, config)
            .expect("spawn node");
        self.nodes.push(dht.clone());
        dht
    }

    /// Make every node ping every other node and wait for it to finish.
    pub async fn connect_all(&self) {
        for a in &self.nodes {
            let seeds: Vec<Node> = self
                .nodes
                .iter()
                .filter(|b| !Arc::ptr_eq(a, b))
                .map(|b| b.self_node().clone())
                .collect();
            for handle in a.bootstrap(seeds) {
                assert!(handle.await.expect("bootstrap task"), "seed should answer");
            }
        }
    }

    pub fn stop_all(&self) {
        for node in &self.nodes {
            node.stop();
        }
    }
}

/// Poll `check` until it holds or `deadline` passes.
pub async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
