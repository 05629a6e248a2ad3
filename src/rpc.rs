//! Request/response plumbing shared by every transport.
//!
//! A transport hands each outgoing request a [`ReplyWaiter`] registered in its
//! [`PendingReplies`] under the request's correlation id. When a response
//! with that id comes back, the transport calls [`PendingReplies::complete`]
//! and the waiter resolves. A waiter that times out (or is dropped) removes
//! its own registration, so an entry is deregistered exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::trace;
use uuid::Uuid;

use crate::protocol::Message;

/// Message transport consumed by [`crate::Kademlia`].
///
/// `write` sends a message and, for requests, returns a waiter for the
/// matching response. Responses and messages that cannot be delivered get
/// [`ReplyWaiter::none`] or a waiter that simply times out; delivery failure
/// is never an error the engine has to handle separately.
///
/// `read` yields inbound requests one at a time and returns `None` once the
/// transport is shut down.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn write(&self, message: Message) -> Result<ReplyWaiter>;

    async fn read(&self) -> Option<Message>;
}

/// Waiting requests, each tagged with the generation that registered it.
#[derive(Debug, Default)]
struct Slots {
    next_generation: u64,
    waiting: HashMap<Uuid, (u64, oneshot::Sender<Message>)>,
}

/// Correlation-id -> waiting request map.
#[derive(Clone, Debug, Default)]
pub struct PendingReplies {
    slots: Arc<Mutex<Slots>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. A previous waiter for the same id stops
    /// receiving and resolves as a timeout; dropping it later leaves the new
    /// registration in place.
    pub fn register(&self, id: Uuid) -> ReplyWaiter {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut slots = self.slots.lock();
            let generation = slots.next_generation;
            slots.next_generation = generation.wrapping_add(1);
            slots.waiting.insert(id, (generation, tx));
            generation
        };
        ReplyWaiter {
            rx: Some(rx),
            guard: Some(SlotGuard {
                id,
                generation,
                slots: self.slots.clone(),
            }),
        }
    }

    /// Hand a response to its waiter. Returns false when nobody is waiting
    /// (late reply, duplicate, or unknown id).
    pub fn complete(&self, message: Message) -> bool {
        let Some((_, tx)) = self.slots.lock().waiting.remove(&message.id) else {
            trace!(id = %message.id, "no waiter for response");
            return false;
        };
        tx.send(message).is_ok()
    }

    /// Number of requests still waiting for an answer.
    pub fn len(&self) -> usize {
        self.slots.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().waiting.is_empty()
    }
}

#[derive(Debug)]
struct SlotGuard {
    id: Uuid,
    generation: u64,
    slots: Arc<Mutex<Slots>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let owned = matches!(
            slots.waiting.get(&self.id),
            Some((generation, _)) if *generation == self.generation
        );
        if owned {
            slots.waiting.remove(&self.id);
        }
    }
}

/// Handle for one outstanding request.
#[derive(Debug)]
pub struct ReplyWaiter {
    rx: Option<oneshot::Receiver<Message>>,
    guard: Option<SlotGuard>,
}

impl ReplyWaiter {
    /// A waiter that never resolves to a message.
    pub fn none() -> Self {
        Self {
            rx: None,
            guard: None,
        }
    }

    /// Wait up to `timeout` for the response.
    pub async fn wait(mut self, timeout: Duration) -> Option<Message> {
        let rx = self.rx.take()?;
        let reply = tokio::time::timeout(timeout, rx).await.ok()?.ok();
        drop(self.guard.take());
        reply
    }
}
