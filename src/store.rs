//! Key/value storage used by the DHT.
//!
//! - [`KeyValueStore`]: the narrow interface to whatever engine persists data.
//! - [`MemoryStore`]: an LRU-bounded in-memory engine with lazy TTL expiry.
//! - [`KademliaStore`]: splits one engine into a data namespace and a
//!   replication-bookkeeping namespace and drives periodic replication.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::node::HashAlgorithm;

/// Namespace for stored values (`d!`).
const PREFIX_DATA: &[u8] = &[0x64, 0x21];

/// Namespace for last-replicated timestamps (`r!`).
const PREFIX_REPLICATION: &[u8] = &[0x72, 0x21];

/// Maximum number of entries kept by [`MemoryStore::new`].
const MEMORY_STORE_MAX_ENTRIES: usize = 100_000;

// ============================================================================
// Records
// ============================================================================

/// A content-addressed value: `key == hash == digest(data)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub hash: Vec<u8>,
}

impl Record {
    pub fn new(algorithm: HashAlgorithm, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let hash = algorithm.digest(&data);
        Self {
            key: hash.clone(),
            data,
            hash,
        }
    }
}

// ============================================================================
// Storage Engine Interface
// ============================================================================

/// One item returned by [`KeyValueStore::iterate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// `None` for entries that never expire.
    pub expires_at: Option<Instant>,
}

/// A persistent key/value engine.
///
/// Implementations own their lifecycle; the DHT only borrows them through an
/// `Arc`. Expired entries must not be returned by `get` or `iterate`.
pub trait KeyValueStore: Send + Sync {
    /// Insert or overwrite `key`. `None` (or a zero duration) never expires.
    fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Snapshot of all live entries whose key starts with `prefix`.
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<StoreEntry>>;

    /// Release resources. Later calls fail.
    fn close(&self) -> Result<()>;
}

#[derive(Debug)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory [`KeyValueStore`] with LRU eviction and lazy TTL expiry.
#[derive(Debug)]
pub struct MemoryStore {
    /// `None` once closed.
    cache: Mutex<Option<LruCache<Vec<u8>, MemoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MEMORY_STORE_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self::with_capacity(cap)
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(Some(LruCache::new(capacity))),
        }
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut LruCache<Vec<u8>, MemoryEntry>) -> T) -> Result<T> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or_else(|| anyhow!("store is closed"))?;
        Ok(f(cache))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| Instant::now() + ttl);
        self.with_cache(|cache| {
            cache.put(
                key.to_vec(),
                MemoryEntry {
                    value: value.to_vec(),
                    expires_at,
                },
            );
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_cache(|cache| {
            let now = Instant::now();
            match cache.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
            cache.pop(key);
            None
        })
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_cache(|cache| {
            cache.pop(key);
        })
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<StoreEntry>> {
        self.with_cache(|cache| {
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut out = Vec::new();
            for (key, entry) in cache.iter() {
                if !key.starts_with(prefix) {
                    continue;
                }
                if entry.is_expired(now) {
                    expired.push(key.clone());
                    continue;
                }
                out.push(StoreEntry {
                    key: key.clone(),
                    value: entry.value.clone(),
                    expires_at: entry.expires_at,
                });
            }
            for key in expired {
                cache.pop(&key);
            }
            out.sort_by(|a, b| a.key.cmp(&b.key));
            out
        })
    }

    fn close(&self) -> Result<()> {
        self.cache.lock().take();
        Ok(())
    }
}

// ============================================================================
// Kademlia Store
// ============================================================================

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

fn encode_timestamp(at: SystemTime) -> [u8; 8] {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    millis.to_be_bytes()
}

/// Decode a stamp written by [`encode_timestamp`]; zero or garbage is `None`.
fn decode_timestamp(bytes: &[u8]) -> Option<SystemTime> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    match u64::from_be_bytes(raw) {
        0 => None,
        millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
    }
}

/// DHT view over a shared [`KeyValueStore`].
///
/// Values live under the `d!` prefix; the time each value was last pushed to
/// its neighbours lives under `r!`. Storage errors are returned to the
/// caller unchanged.
pub struct KademliaStore {
    inner: Arc<dyn KeyValueStore>,
    algorithm: HashAlgorithm,
    /// Set while a [`PendingReplication`] scan is alive.
    replicating: AtomicBool,
}

impl KademliaStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            algorithm,
            replicating: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(&prefixed(PREFIX_DATA, key))
    }

    /// Store a value and stamp it as replicated now.
    pub fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.inner.set(&prefixed(PREFIX_DATA, key), value, ttl)?;
        self.mark_replicated(key, ttl)
    }

    /// Record that `key` was just pushed to its neighbours.
    pub fn mark_replicated(&self, key: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.inner.set(
            &prefixed(PREFIX_REPLICATION, key),
            &encode_timestamp(SystemTime::now()),
            ttl,
        )
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(&prefixed(PREFIX_DATA, key))?;
        self.inner.delete(&prefixed(PREFIX_REPLICATION, key))
    }

    /// Stored values whose key starts with `prefix`, keys without namespace.
    pub fn iterate(&self, prefix: &[u8]) -> Result<Vec<StoreEntry>> {
        let entries = self.inner.iterate(&prefixed(PREFIX_DATA, prefix))?;
        Ok(entries
            .into_iter()
            .map(|mut entry| {
                entry.key = entry.key.split_off(PREFIX_DATA.len());
                entry
            })
            .collect())
    }

    /// Number of stored values.
    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.iterate(PREFIX_DATA)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Values not replicated within `interval`.
    ///
    /// Walks the data namespace and checks each value's stamp; a value with
    /// no readable stamp is due. Only one scan runs at a time: while the
    /// returned iterator is alive, a second call yields nothing. Values are
    /// re-hashed into [`Record`]s as the iterator advances.
    pub fn pending_replication(&self, interval: Duration) -> PendingReplication<'_> {
        if self
            .replicating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("replication scan already running");
            return PendingReplication::idle(self);
        }
        let values = match self.inner.iterate(PREFIX_DATA) {
            Ok(values) => values,
            Err(err) => {
                warn!("replication scan failed: {err:?}");
                self.replicating.store(false, Ordering::Release);
                return PendingReplication::idle(self);
            }
        };
        PendingReplication {
            store: self,
            values: values.into_iter(),
            interval,
            now: SystemTime::now(),
            active: true,
        }
    }

    /// Whether `key` was last replicated at least `interval` before `now`.
    fn is_due(&self, key: &[u8], now: SystemTime, interval: Duration) -> bool {
        let stamp = match self.inner.get(&prefixed(PREFIX_REPLICATION, key)) {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(key = %hex::encode(key), "failed to read replication stamp: {err:?}");
                None
            }
        };
        match stamp.as_deref().and_then(decode_timestamp) {
            Some(at) => now.duration_since(at).map(|age| age >= interval).unwrap_or(false),
            None => true,
        }
    }
}

/// Iterator returned by [`KademliaStore::pending_replication`].
pub struct PendingReplication<'a> {
    store: &'a KademliaStore,
    values: std::vec::IntoIter<StoreEntry>,
    interval: Duration,
    now: SystemTime,
    /// Whether this iterator owns the single-flight flag.
    active: bool,
}

impl<'a> PendingReplication<'a> {
    fn idle(store: &'a KademliaStore) -> Self {
        Self {
            store,
            values: Vec::new().into_iter(),
            interval: Duration::ZERO,
            now: SystemTime::now(),
            active: false,
        }
    }
}

impl Iterator for PendingReplication<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        for entry in self.values.by_ref() {
            let key = &entry.key[PREFIX_DATA.len()..];
            if self.store.is_due(key, self.now, self.interval) {
                return Some(Record::new(self.store.algorithm, entry.value));
            }
        }
        None
    }
}

impl Drop for PendingReplication<'_> {
    fn drop(&mut self) {
        if self.active {
            self.store.replicating.store(false, Ordering::Release);
        }
    }
}
