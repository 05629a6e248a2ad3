//! Transport over iroh QUIC endpoints.
//!
//! Every message travels on its own connection: the sender opens a
//! bi-directional stream for [`DHT_ALPN`], writes one frame holding the JSON
//! encoded [`Message`], and waits for an empty acknowledgement frame before
//! closing. Replies are not sent back on that stream; the peer answers with a
//! fresh connection to the address found in the request's sender descriptor,
//! so requests and responses share one code path on both sides.
//!
//! The inbound half lives in [`crate::server`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use iroh::{Endpoint, EndpointAddr};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::framing::{read_frame, write_frame};
use crate::node::Node;
use crate::protocol::Message;
use crate::rpc::{PendingReplies, ReplyWaiter, RpcTransport};
use crate::server::DhtProtocolHandler;

/// ALPN protocol identifier for DHT connections.
pub const DHT_ALPN: &[u8] = b"kad-sdht/1";

/// Inbound requests buffered before accepting connections stalls.
const INBOX_CAPACITY: usize = 1024;

/// Find the first address of `node` that parses as a JSON [`EndpointAddr`].
pub fn endpoint_addr(node: &Node) -> Result<EndpointAddr> {
    node.addrs
        .iter()
        .find_map(|addr| serde_json::from_str::<EndpointAddr>(addr).ok())
        .ok_or_else(|| anyhow!("node {node} has no iroh endpoint address"))
}

/// Serialise `addr` into the form stored in [`Node::addrs`].
pub fn encode_endpoint_addr(addr: &EndpointAddr) -> Result<String> {
    Ok(serde_json::to_string(addr)?)
}

/// [`RpcTransport`] backed by an iroh [`Endpoint`].
///
/// Register [`IrohTransport::handler`] on the endpoint's router under
/// [`DHT_ALPN`] so inbound messages reach [`RpcTransport::read`].
pub struct IrohTransport {
    endpoint: Endpoint,
    pending: PendingReplies,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<mpsc::Receiver<Message>>,
}

impl IrohTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            endpoint,
            pending: PendingReplies::new(),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Protocol handler feeding this transport.
    pub fn handler(&self) -> DhtProtocolHandler {
        DhtProtocolHandler::new(self.pending.clone(), self.inbox_tx.clone())
    }

    fn dispatch(&self, message: Message) {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let id = message.id;
            if let Err(err) = send_message(&endpoint, message).await {
                debug!(%id, "message delivery failed: {err:?}");
            }
        });
    }
}

/// Deliver one message on a dedicated connection.
async fn send_message(endpoint: &Endpoint, message: Message) -> Result<()> {
    let receiver = message
        .receiver
        .as_ref()
        .ok_or_else(|| anyhow!("message has no receiver"))?;
    let addr = endpoint_addr(receiver)?;
    let bytes = message.encode()?;

    let conn = endpoint
        .connect(addr, DHT_ALPN)
        .await
        .with_context(|| format!("connecting to {receiver}"))?;
    let (mut send, mut recv) = conn.open_bi().await?;
    write_frame(&mut send, &bytes).await?;
    send.finish()?;
    // Empty acknowledgement frame.
    read_frame(&mut recv).await?;
    conn.close(0u32.into(), b"done");
    Ok(())
}

#[async_trait]
impl RpcTransport for IrohTransport {
    async fn write(&self, message: Message) -> Result<ReplyWaiter> {
        if message.receiver.is_none() {
            return Ok(ReplyWaiter::none());
        }
        if message.is_response {
            self.dispatch(message);
            return Ok(ReplyWaiter::none());
        }
        let waiter = self.pending.register(message.id);
        self.dispatch(message);
        Ok(waiter)
    }

    async fn read(&self) -> Option<Message> {
        self.inbox_rx.lock().await.recv().await
    }
}
