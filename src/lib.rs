//! # kad-sdht
//!
//! A Kademlia distributed hash table node. Peers are organised by the XOR
//! distance between their content hashes, lookups walk the key space with
//! bounded parallelism, and stored values expire and get replicated to their
//! current neighbours in the background.
//!
//! The engine only talks to the outside world through two traits:
//!
//! - [`RpcTransport`] moves [`Message`]s between peers. [`MemoryTransport`]
//!   (an explicit in-process [`MemoryNetwork`]) and [`IrohTransport`] (QUIC
//!   via [`iroh`](https://crates.io/crates/iroh)) are provided.
//! - [`KeyValueStore`] persists values. [`MemoryStore`] is provided.
//!
//! Modules, leaves first:
//!
//! - [`node`]: node descriptors, content hashing, the XOR metric.
//! - [`bucket`], [`routing`], [`contacts`]: the routing table and the
//!   per-lookup candidate set.
//! - [`protocol`], [`framing`]: the wire message and its framing.
//! - [`rpc`], [`memory`], [`net`], [`server`]: transports.
//! - [`store`]: storage traits and the replication-aware wrapper.
//! - [`config`]: tunables.
//! - [`kademlia`]: the engine.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use kad_sdht::{DhtConfig, HashAlgorithm, Kademlia, MemoryNetwork, MemoryStore, Node};
//!
//! # async fn launch() -> Result<()> {
//! let network = MemoryNetwork::new();
//! let me = Node::from_public_key(HashAlgorithm::Blake3, b"my public key");
//! let transport = Arc::new(network.register(&me));
//! let dht = Kademlia::spawn(me, Arc::new(MemoryStore::new()), transport, DhtConfig::default())?;
//!
//! let outcome = dht.store(b"hello".to_vec()).await;
//! if outcome.acknowledged > 0 {
//!     let _ = dht.find_value(&outcome.key).await;
//! }
//! dht.stop();
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` runs a node on an iroh endpoint.

pub mod bucket;
pub mod config;
pub mod contacts;
pub mod framing;
pub mod kademlia;
pub mod memory;
pub mod net;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod store;

pub use config::{ConfigError, DhtConfig, NodeSettings};
pub use contacts::Contacts;
pub use kademlia::{Kademlia, StoreOutcome};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use net::{IrohTransport, DHT_ALPN};
pub use node::{ConnectionType, Distance, HashAlgorithm, Node};
pub use protocol::{Message, MessageError, MessageType};
pub use routing::RoutingTable;
pub use rpc::{PendingReplies, ReplyWaiter, RpcTransport};
pub use server::{handle_connection, DhtProtocolHandler};
pub use store::{KademliaStore, KeyValueStore, MemoryStore, Record, StoreEntry};
