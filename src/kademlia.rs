//! The Kademlia engine.
//!
//! [`Kademlia`] ties the routing table, the local store and an
//! [`RpcTransport`] together. Spawning one starts two long-lived tasks:
//!
//! - the listen loop, which answers PING / STORE / FIND_NODE / FIND_VALUE
//!   requests read from the transport;
//! - the maintenance scheduler, which every `tick_interval` replicates
//!   stored values, refreshes stale buckets and republishes values this node
//!   originated.
//!
//! Both stop when [`Kademlia::stop`] is called. RPCs already in flight are
//! not cancelled; they resolve on their own timeout.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::contacts::Contacts;
use crate::node::Node;
use crate::protocol::{Message, MessageType};
use crate::routing::RoutingTable;
use crate::rpc::RpcTransport;
use crate::store::{KademliaStore, KeyValueStore, Record};

/// Key read once at start-up to make sure the store answers.
const STORE_PROBE_KEY: &[u8] = b"kad-sdht/probe";

/// Result of [`Kademlia::store`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Content key of the stored value.
    pub key: Vec<u8>,
    /// Number of peers that confirmed the STORE. Zero means nobody has it.
    pub acknowledged: usize,
}

struct Published {
    record: Record,
    at: Instant,
}

/// A DHT node.
pub struct Kademlia<T: RpcTransport> {
    self_node: Node,
    config: DhtConfig,
    table: RoutingTable,
    store: KademliaStore,
    transport: Arc<T>,
    /// Values originated here, for republishing.
    published: Mutex<LruCache<Vec<u8>, Published>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl<T: RpcTransport> Kademlia<T> {
    /// Validate the inputs, build the node and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        self_node: Node,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<T>,
        config: DhtConfig,
    ) -> Result<Arc<Self>> {
        if !self_node.is_valid() {
            bail!("invalid local node identity");
        }
        config.validate()?;
        store
            .get(STORE_PROBE_KEY)
            .context("key/value store is not usable")?;

        let published_cap =
            NonZeroUsize::new(config.max_published_records).unwrap_or(NonZeroUsize::MIN);
        let (shutdown, _) = watch::channel(false);
        let node = Arc::new(Self {
            table: RoutingTable::new(self_node.clone(), config.k),
            store: KademliaStore::new(store, config.hash_algorithm),
            self_node,
            transport,
            published: Mutex::new(LruCache::new(published_cap)),
            shutdown,
            stopped: AtomicBool::new(false),
            config,
        });

        tokio::spawn(node.clone().listen(node.shutdown.subscribe()));
        tokio::spawn(node.clone().maintain(node.shutdown.subscribe()));
        info!(
            node = %node.self_node,
            k = node.config.k,
            alpha = node.config.alpha,
            "kademlia node started"
        );
        Ok(node)
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// The local value store.
    pub fn storage(&self) -> &KademliaStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Ping every seed in the background and add the ones that answer.
    ///
    /// Returns immediately. The handles resolve to each ping's outcome and
    /// may be dropped.
    pub fn bootstrap(
        self: &Arc<Self>,
        seeds: impl IntoIterator<Item = Node>,
    ) -> Vec<JoinHandle<bool>> {
        seeds
            .into_iter()
            .filter(|seed| seed.is_valid() && *seed != self.self_node)
            .map(|seed| {
                let node = self.clone();
                tokio::spawn(async move {
                    let alive = node.ping(&seed).await;
                    info!(peer = %seed, alive, "bootstrap ping");
                    alive
                })
            })
            .collect()
    }

    /// Ping `node`. A reply refreshes it in the routing table; silence
    /// removes it.
    pub async fn ping(&self, node: &Node) -> bool {
        let message = Message::compose(&self.self_node).to(node).ping();
        match self.request(message).await {
            Some(_) => {
                self.observe(node.clone());
                true
            }
            None => {
                debug!(peer = %node, "ping timed out");
                self.table.remove(node);
                false
            }
        }
    }

    /// Publish `data` on the peers closest to its content hash.
    ///
    /// The value is not kept locally. Check
    /// [`StoreOutcome::acknowledged`]; zero means the store failed.
    pub async fn store(&self, data: impl Into<Vec<u8>>) -> StoreOutcome {
        let record = Record::new(self.config.hash_algorithm, data);
        let acknowledged = self.store_record(&record).await;
        let key = record.key.clone();
        self.published.lock().put(
            key.clone(),
            Published {
                record,
                at: Instant::now(),
            },
        );
        StoreOutcome { key, acknowledged }
    }

    /// The closest node to `key` found by one iterative lookup.
    pub async fn find_node(&self, key: &[u8]) -> Option<Node> {
        self.iterative_find_node(key).await.into_iter().next()
    }

    /// Look `key` up locally, then on the network.
    pub async fn find_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.store.get(key) {
            Ok(Some(data)) => return Some(data),
            Ok(None) => {}
            Err(err) => warn!(key = %hex::encode(key), "local read failed: {err:?}"),
        }

        let candidates =
            Contacts::new(Node::from_hash(key), std::slice::from_ref(&self.self_node));
        for node in self.iterative_find_node(key).await {
            candidates.append(node);
        }

        let mut idx = 0;
        while let Some(node) = candidates.get(idx) {
            idx += 1;
            let message = Message::compose(&self.self_node).to(&node).find_value(key);
            let Some(reply) = self.request(message).await else {
                self.table.remove(&node);
                continue;
            };
            self.observe(node.clone());
            if let Some(payload) = reply.value() {
                if self.config.hash_algorithm.verify(key, &payload.data) {
                    return Some(payload.data.clone());
                }
                debug!(peer = %node, key = %hex::encode(key), "value does not match key");
            } else if let Some(closer) = reply.closest() {
                for peer in closer {
                    candidates.append(peer.clone());
                }
            }
        }
        None
    }

    /// Stop the listen loop and the scheduler. Returns `true` for the call
    /// that actually stopped the node.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        info!(node = %self.self_node, "kademlia node stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Send `message` and wait for its reply.
    async fn request(&self, message: Message) -> Option<Message> {
        let id = message.id;
        match self.transport.write(message).await {
            Ok(waiter) => waiter.wait(self.config.rpc_timeout).await,
            Err(err) => {
                debug!(%id, "write failed: {err:?}");
                None
            }
        }
    }

    fn observe(&self, node: Node) {
        if let Some(evicted) = self.table.update(node) {
            trace!(peer = %evicted, "dropped from full bucket");
        }
    }

    /// Up to `k` nodes closest to `key`, nearest first.
    ///
    /// Starts from the `alpha` closest known peers and queries them in
    /// parallel. Peers that answer are refreshed in the routing table and
    /// the nodes they return join the candidate set; peers that stay silent
    /// are evicted. Another round queries the next `alpha` unqueried
    /// candidates as long as the previous one found someone closer, for at
    /// most `max_lookup_rounds` rounds. Peers that failed once are not
    /// re-added during the same lookup.
    pub async fn iterative_find_node(&self, key: &[u8]) -> Vec<Node> {
        let target = Node::from_hash(key);
        let seeds = self.table.kclosest(self.config.alpha, &target, &[]);
        if seeds.is_empty() {
            return Vec::new();
        }

        let contacts = Contacts::new(target.clone(), std::slice::from_ref(&self.self_node));
        for seed in seeds {
            contacts.append(seed);
        }
        contacts.sort();

        let mut queried: HashSet<Vec<u8>> = HashSet::new();
        let mut failed: HashSet<Vec<u8>> = HashSet::new();
        let mut best = contacts.first().map(|n| n.distance_between(&target));

        for round in 0..self.config.max_lookup_rounds {
            let batch: Vec<Node> = contacts
                .nodes()
                .into_iter()
                .filter(|n| !queried.contains(&n.id))
                .take(self.config.alpha)
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|n| n.id.clone()));

            let replies = join_all(batch.into_iter().map(|node| async move {
                let message = Message::compose(&self.self_node).to(&node).find_node(key);
                let reply = self.request(message).await;
                (node, reply)
            }))
            .await;

            for (node, reply) in replies {
                match reply {
                    Some(reply) => {
                        for peer in reply.closest().unwrap_or_default() {
                            if peer.is_valid() && !failed.contains(&peer.id) {
                                contacts.append(peer.clone());
                            }
                        }
                        self.observe(node);
                    }
                    None => {
                        debug!(peer = %node, "no FIND_NODE reply, evicting");
                        self.table.remove(&node);
                        contacts.remove(&node);
                        failed.insert(node.id);
                    }
                }
            }
            contacts.sort();

            let closest = contacts.first().map(|n| n.distance_between(&target));
            let improved = match (&closest, &best) {
                (Some(now), Some(before)) => now < before,
                (Some(_), None) => true,
                (None, _) => false,
            };
            trace!(round, improved, candidates = contacts.len(), "lookup round");
            if !improved {
                break;
            }
            best = closest;
        }

        contacts.truncate(self.config.k);
        contacts.into_nodes()
    }

    /// STORE `record` on the closest peers; returns how many confirmed.
    async fn store_record(&self, record: &Record) -> usize {
        let targets = self.iterative_find_node(&record.hash).await;
        if targets.is_empty() {
            debug!(key = %hex::encode(&record.key), "no peers to store on");
            return 0;
        }

        let mut tasks = JoinSet::new();
        for node in targets {
            let message = Message::compose(&self.self_node).to(&node).store(record);
            let transport = self.transport.clone();
            let timeout = self.config.rpc_timeout;
            tasks.spawn(async move {
                let reply = match transport.write(message).await {
                    Ok(waiter) => waiter.wait(timeout).await,
                    Err(err) => {
                        debug!(peer = %node, "STORE write failed: {err:?}");
                        None
                    }
                };
                (node, reply)
            });
        }

        let mut acknowledged = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node, Some(reply))) => {
                    if reply.success_flag() == Some(true) {
                        acknowledged += 1;
                    }
                    self.observe(node);
                }
                Ok((node, None)) => {
                    self.table.remove(&node);
                }
                Err(err) => warn!("STORE task failed: {err}"),
            }
        }
        debug!(key = %hex::encode(&record.key), acknowledged, "stored");
        acknowledged
    }

    // ========================================================================
    // Inbound requests
    // ========================================================================

    async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = self.transport.read() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("transport closed");
                        break;
                    }
                },
            }
        }
        debug!(node = %self.self_node, "listen loop exited");
    }

    async fn handle_message(&self, message: Message) {
        if message.is_response {
            trace!(id = %message.id, "ignoring unsolicited response");
            return;
        }
        if let Err(err) = message.validate() {
            debug!(id = %message.id, "dropping malformed message: {err}");
            return;
        }
        let Some(sender) = message.sender.clone() else {
            return;
        };

        let reply = match message.kind {
            MessageType::Ping => message.pong(),
            MessageType::Store => {
                self.observe(sender);
                message.success(self.handle_store(&message))
            }
            MessageType::FindValue => {
                self.observe(sender.clone());
                let key = message.find_key().unwrap_or_default();
                match self.store.get(key) {
                    Ok(Some(data)) => message.return_value(data),
                    Ok(None) => message.return_closest(self.closest_to(key, &sender)),
                    Err(err) => {
                        warn!(key = %hex::encode(key), "local read failed: {err:?}");
                        message.return_closest(self.closest_to(key, &sender))
                    }
                }
            }
            MessageType::FindNode => {
                self.observe(sender.clone());
                let key = message.find_key().unwrap_or_default();
                message.return_closest(self.closest_to(key, &sender))
            }
            MessageType::Noop => return,
        };

        if let Err(err) = self.transport.write(reply).await {
            debug!(id = %message.id, "failed to send reply: {err:?}");
        }
    }

    fn handle_store(&self, message: &Message) -> bool {
        let Some(payload) = message.store_payload() else {
            return false;
        };
        if !self.config.hash_algorithm.verify(&payload.key, &payload.data) {
            debug!(key = %hex::encode(&payload.key), "rejecting STORE with mismatched key");
            return false;
        }
        match self
            .store
            .set(&payload.key, &payload.data, Some(self.config.entry_ttl))
        {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %hex::encode(&payload.key), "failed to persist value: {err:?}");
                false
            }
        }
    }

    fn closest_to(&self, key: &[u8], requester: &Node) -> Vec<Node> {
        self.table.kclosest(
            self.config.k,
            &Node::from_hash(key),
            std::slice::from_ref(requester),
        )
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn maintain(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::join!(
                        self.replicate_database(),
                        self.refresh_buckets(),
                        self.republish(),
                    );
                }
            }
        }
        debug!(node = %self.self_node, "scheduler exited");
    }

    /// Push values not replicated within `replication_interval` to their
    /// current closest peers.
    pub async fn replicate_database(&self) {
        let mut replicated = 0usize;
        for record in self
            .store
            .pending_replication(self.config.replication_interval)
        {
            if self.store_record(&record).await == 0 {
                continue;
            }
            replicated += 1;
            if let Err(err) = self
                .store
                .mark_replicated(&record.key, Some(self.config.entry_ttl))
            {
                warn!(key = %hex::encode(&record.key), "failed to stamp replication: {err:?}");
            }
        }
        if replicated > 0 {
            debug!(replicated, "replication pass done");
        }
    }

    /// Run a lookup through every bucket not refreshed within
    /// `refresh_interval`.
    pub async fn refresh_buckets(&self) {
        let due: Vec<(usize, Node)> = self
            .table
            .buckets_needed_for_refresh(self.config.refresh_interval)
            .into_iter()
            .filter_map(|idx| self.table.random_node_from_bucket(idx).map(|n| (idx, n)))
            .collect();
        if due.is_empty() {
            return;
        }

        let results = join_all(due.into_iter().map(|(idx, node)| async move {
            let found = self.iterative_find_node(&node.hash).await;
            (idx, !found.is_empty())
        }))
        .await;

        let mut refreshed = 0usize;
        for (idx, ok) in results {
            if ok {
                self.table.mark_bucket_refreshed(idx);
                refreshed += 1;
            }
        }
        debug!(refreshed, "bucket refresh done");
    }

    /// Re-store values this node published more than `republish_interval`
    /// ago.
    pub async fn republish(&self) {
        let interval = self.config.republish_interval;
        let due: Vec<Record> = {
            let published = self.published.lock();
            published
                .iter()
                .filter(|(_, entry)| entry.at.elapsed() >= interval)
                .map(|(_, entry)| entry.record.clone())
                .collect()
        };

        for record in due {
            let acknowledged = self.store_record(&record).await;
            debug!(key = %hex::encode(&record.key), acknowledged, "republished");
            if let Some(entry) = self.published.lock().peek_mut(&record.key) {
                entry.at = Instant::now();
            }
        }
    }
}
