//! Node identity, content hashing and the XOR distance metric.
//!
//! A [`Node`] carries two byte strings: an opaque identity (`id`) that decides
//! equality, and a fixed-length digest (`hash`) that decides *where* the node
//! lives in the key space. All distance computation goes through the digest:
//!
//! - [`Node::xor`] / [`Node::zero_prefix_len`] pick the routing bucket,
//! - [`Node::distance_between`] orders candidates during a lookup.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher as StdHasher};

use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_512;

/// Upper bound for identity bytes (a multihash-wrapped 512-bit key fits).
pub const MAX_ID_LEN: usize = 66;

/// Upper bound for digest bytes (512 bits).
pub const MAX_HASH_LEN: usize = 64;

// ============================================================================
// Content Hashing
// ============================================================================

/// Digest used for node hashes and content-addressed keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// 256-bit BLAKE3.
    #[default]
    Blake3,
    /// 256-bit SHA-256.
    Sha256,
    /// 512-bit SHA3-512.
    Sha3_512,
}

impl HashAlgorithm {
    /// Compute the digest of `data`.
    ///
    /// ```
    /// use kad_sdht::HashAlgorithm;
    ///
    /// let key = HashAlgorithm::Blake3.digest(b"hello world");
    /// assert_eq!(key.len(), 32);
    /// assert_eq!(key, HashAlgorithm::Blake3.digest(b"hello world"));
    /// ```
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Blake3 => {
                let mut hasher = Hasher::new();
                hasher.update(data);
                hasher.finalize().as_bytes().to_vec()
            }
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha3_512 => Sha3_512::digest(data).to_vec(),
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Blake3 | HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha3_512 => 64,
        }
    }

    /// Check that `key` is the digest of `data`.
    pub fn verify(self, key: &[u8], data: &[u8]) -> bool {
        self.digest(data) == key
    }
}

// ============================================================================
// Node Descriptor
// ============================================================================

/// Connectivity state last observed for a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    NotConnected,
    Connected,
    Connectable,
    CannotConnect,
}

/// A peer in the DHT.
///
/// Equality and hashing look at `id` only; two descriptors with the same id
/// but different addresses are the same peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Node {
    /// Identity bytes (typically the raw public key).
    pub id: Vec<u8>,
    /// Digest of the identity; the node's position in the key space.
    pub hash: Vec<u8>,
    /// Transport-level peer reference.
    #[serde(default)]
    pub peer_id: Vec<u8>,
    /// Known addresses. The iroh transport expects JSON `EndpointAddr`s.
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub connection: ConnectionType,
}

impl Node {
    /// Build a node from explicit identity and digest bytes.
    pub fn new(id: impl Into<Vec<u8>>, hash: impl Into<Vec<u8>>) -> Self {
        let id = id.into();
        Self {
            peer_id: id.clone(),
            id,
            hash: hash.into(),
            addrs: Vec::new(),
            connection: ConnectionType::NotConnected,
        }
    }

    /// Derive a node from public key bytes: `hash = digest(key)`.
    pub fn from_public_key(algorithm: HashAlgorithm, key: &[u8]) -> Self {
        Self::new(key.to_vec(), algorithm.digest(key))
    }

    /// A placeholder node positioned at `hash`, used as a lookup target.
    pub fn from_hash(hash: impl Into<Vec<u8>>) -> Self {
        let hash = hash.into();
        Self::new(hash.clone(), hash)
    }

    /// Attach known addresses.
    pub fn with_addrs(mut self, addrs: Vec<String>) -> Self {
        self.addrs = addrs;
        self
    }

    /// Both `id` and `hash` are present and within their length bounds.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && self.id.len() <= MAX_ID_LEN
            && !self.hash.is_empty()
            && self.hash.len() <= MAX_HASH_LEN
    }

    /// Width of the node's digest in bits.
    pub fn hash_bits(&self) -> usize {
        self.hash.len() * 8
    }

    /// Byte-wise XOR of the two hashes, truncated to the shorter one.
    pub fn xor(&self, other: &Node) -> Vec<u8> {
        self.hash
            .iter()
            .zip(other.hash.iter())
            .map(|(a, b)| a ^ b)
            .collect()
    }

    /// Number of leading zero bits of [`Node::xor`]; the bucket index.
    ///
    /// Identical hashes map to the last bucket (`len * 8 - 1`).
    pub fn zero_prefix_len(&self, other: &Node) -> usize {
        let distance = self.xor(other);
        for (byte_idx, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        (distance.len() * 8).saturating_sub(1)
    }

    /// XOR distance as an unsigned big-endian integer, for ordering only.
    pub fn distance_between(&self, other: &Node) -> Distance {
        let len = self.hash.len().max(other.hash.len());
        let pad = |hash: &[u8]| -> Vec<u8> {
            let mut out = vec![0u8; len - hash.len()];
            out.extend_from_slice(hash);
            out
        };
        let a = pad(&self.hash);
        let b = pad(&other.hash);
        let xored: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();
        Distance::from_be_bytes(&xored)
    }

    /// Hex encoding of the node hash.
    pub fn hex_string(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: StdHasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.hex_string();
        f.write_str(&hex[..hex.len().min(12)])
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("hash", &format_args!("{self}"))
            .field("addrs", &self.addrs)
            .field("connection", &self.connection)
            .finish()
    }
}

// ============================================================================
// Distance
// ============================================================================

/// An XOR distance with big-integer ordering.
///
/// Leading zero bytes are stripped, so distances computed from digests of
/// different widths still compare numerically.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Distance(Vec<u8>);

impl Distance {
    fn from_be_bytes(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[first..].to_vec())
    }

    /// `true` for the distance between a node and itself.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
