//! Runs a DHT node on an iroh endpoint.
//!
//! # Usage
//!
//! ```bash
//! kad-sdht [settings.json]
//! ```
//!
//! The optional settings file holds a [`NodeSettings`] document: a `dht`
//! section with [`kad_sdht::DhtConfig`] overrides and a `bootstrap` list of
//! seed nodes (JSON node descriptors whose `addrs` carry endpoint addresses).
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use std::sync::Arc;

use anyhow::Result;
use iroh::protocol::Router;
use iroh::{Endpoint, RelayMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kad_sdht::net::encode_endpoint_addr;
use kad_sdht::{IrohTransport, Kademlia, MemoryStore, Node, NodeSettings, DHT_ALPN};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => NodeSettings::from_json_file(path)?,
        None => NodeSettings::default(),
    };

    let endpoint = Endpoint::builder()
        .alpns(vec![DHT_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;

    // The node's position in the key space is the digest of its public key.
    let addr_json = encode_endpoint_addr(&endpoint.addr())?;
    let self_node = Node::from_public_key(settings.dht.hash_algorithm, endpoint.id().as_bytes())
        .with_addrs(vec![addr_json.clone()]);

    info!(node = %self_node, hash = %self_node.hex_string(), "DHT node starting");
    info!(addr = %addr_json, "endpoint bound");

    let transport = Arc::new(IrohTransport::new(endpoint.clone()));
    let router = Router::builder(endpoint.clone())
        .accept(DHT_ALPN, transport.handler())
        .spawn();

    let dht = Kademlia::spawn(
        self_node,
        Arc::new(MemoryStore::new()),
        transport,
        settings.dht,
    )?;
    dht.bootstrap(settings.bootstrap);

    tokio::signal::ctrl_c().await?;
    info!(peers = dht.table().size(), "shutting down");
    dht.stop();
    router.shutdown().await?;
    Ok(())
}
