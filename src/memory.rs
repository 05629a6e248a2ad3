//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] is an explicit registry: every node that joins gets a
//! [`MemoryTransport`] bound to it, and messages are routed by the receiver's
//! id. Nothing is global, so independent networks can live side by side in
//! one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::trace;

use crate::node::Node;
use crate::protocol::{Message, MessageType};
use crate::rpc::{PendingReplies, ReplyWaiter, RpcTransport};

#[derive(Clone)]
struct Endpoint {
    inbox: mpsc::UnboundedSender<Message>,
    pending: PendingReplies,
}

/// Registry of in-memory peers.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<Vec<u8>, Endpoint>>,
    offline: RwLock<HashSet<Vec<u8>>>,
    latencies: RwLock<HashMap<Vec<u8>, Duration>>,
    /// Delivered requests per (kind, receiver).
    requests: RwLock<HashMap<(MessageType, Vec<u8>), usize>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node` to the network. Registering the same id again replaces
    /// the previous transport, whose `read` then returns `None`.
    pub fn register(self: &Arc<Self>, node: &Node) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = PendingReplies::new();
        self.peers.write().insert(
            node.id.clone(),
            Endpoint {
                inbox: tx,
                pending: pending.clone(),
            },
        );
        MemoryTransport {
            network: self.clone(),
            id: node.id.clone(),
            inbox: Mutex::new(rx),
            pending,
        }
    }

    /// Detach a node. Its transport's `read` returns `None` once drained.
    pub fn unregister(&self, node: &Node) {
        self.peers.write().remove(&node.id);
    }

    /// Drop every message to or from `node` while `offline` is true.
    pub fn set_offline(&self, node: &Node, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(node.id.clone());
        } else {
            set.remove(&node.id);
        }
    }

    /// Delay every message delivered to `node`.
    pub fn set_latency(&self, node: &Node, latency: Duration) {
        self.latencies.write().insert(node.id.clone(), latency);
    }

    /// Number of requests of `kind` that reached `node`.
    pub fn requests_to(&self, node: &Node, kind: MessageType) -> usize {
        self.requests
            .read()
            .get(&(kind, node.id.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of requests of `kind` delivered anywhere.
    pub fn request_count(&self, kind: MessageType) -> usize {
        self.requests
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, count)| count)
            .sum()
    }

    /// Reset the request counters.
    pub fn clear_requests(&self) {
        self.requests.write().clear();
    }

    fn is_offline(&self, id: &[u8]) -> bool {
        self.offline.read().contains(id)
    }

    fn deliver(self: &Arc<Self>, from: &[u8], message: Message) {
        let Some(to) = message.receiver.as_ref().map(|n| n.id.clone()) else {
            return;
        };
        if self.is_offline(from) || self.is_offline(&to) {
            trace!(id = %message.id, "dropping message for offline peer");
            return;
        }
        let Some(endpoint) = self.peers.read().get(&to).cloned() else {
            trace!(id = %message.id, "no such peer");
            return;
        };
        let latency = self.latencies.read().get(&to).copied();
        if !message.is_response {
            *self.requests.write().entry((message.kind, to)).or_insert(0) += 1;
        }
        match latency {
            Some(delay) => {
                tokio::spawn(async move {
                    sleep(delay).await;
                    Self::hand_over(endpoint, message);
                });
            }
            None => Self::hand_over(endpoint, message),
        }
    }

    fn hand_over(endpoint: Endpoint, message: Message) {
        if message.is_response {
            endpoint.pending.complete(message);
        } else {
            let _ = endpoint.inbox.send(message);
        }
    }
}

/// [`RpcTransport`] for one node of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    id: Vec<u8>,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
    pending: PendingReplies,
}

impl MemoryTransport {
    /// Requests sent by this node still waiting for an answer.
    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }
}

#[async_trait]
impl RpcTransport for MemoryTransport {
    async fn write(&self, message: Message) -> Result<ReplyWaiter> {
        if message.receiver.is_none() {
            return Ok(ReplyWaiter::none());
        }
        if message.is_response {
            self.network.deliver(&self.id, message);
            return Ok(ReplyWaiter::none());
        }
        let waiter = self.pending.register(message.id);
        self.network.deliver(&self.id, message);
        Ok(waiter)
    }

    async fn read(&self) -> Option<Message> {
        self.inbox.lock().await.recv().await
    }
}
