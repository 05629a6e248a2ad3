use std::fmt;
use std::io;

use anyhow::Result;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::framing::{read_frame, write_frame};
use crate::protocol::Message;
use crate::rpc::PendingReplies;

/// Handles a single incoming connection for the DHT ALPN.
///
/// The connection carries exactly one framed message. It is acknowledged with
/// an empty frame, then responses are matched against the pending-reply
/// registry and requests are queued for the engine's listen loop. The client
/// closes the connection once it has read the acknowledgement.
pub async fn handle_connection(
    pending: PendingReplies,
    inbox: mpsc::Sender<Message>,
    conn: Connection,
) -> Result<()> {
    let (mut send, mut recv): (SendStream, RecvStream) = conn.accept_bi().await?;
    let Some(bytes) = read_frame(&mut recv).await? else {
        return Ok(());
    };
    write_frame(&mut send, &[]).await?;
    send.finish()?;

    match Message::decode(&bytes) {
        Ok(message) if message.is_response => {
            pending.complete(message);
        }
        Ok(message) => {
            if inbox.send(message).await.is_err() {
                trace!("transport dropped, discarding request");
            }
        }
        Err(err) => debug!("undecodable message: {err:?}"),
    }

    conn.closed().await;
    Ok(())
}

/// The router entry point for inbound [`crate::net::DHT_ALPN`] connections.
///
/// Obtain one from [`crate::IrohTransport::handler`] and pass it to
/// `Router::builder(endpoint).accept(DHT_ALPN, handler)`.
#[derive(Clone)]
pub struct DhtProtocolHandler {
    pending: PendingReplies,
    inbox: mpsc::Sender<Message>,
}

impl DhtProtocolHandler {
    pub(crate) fn new(pending: PendingReplies, inbox: mpsc::Sender<Message>) -> Self {
        Self { pending, inbox }
    }
}

impl fmt::Debug for DhtProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtProtocolHandler")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ProtocolHandler for DhtProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let pending = self.pending.clone();
        let inbox = self.inbox.clone();
        async move {
            handle_connection(pending, inbox, connection)
                .await
                .map_err(|err| AcceptError::from_err(io::Error::new(io::ErrorKind::Other, err)))
        }
    }
}
