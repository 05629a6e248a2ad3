//! DHT policy configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::node::{HashAlgorithm, Node};

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;

/// Default parallelism for lookups.
pub const DEFAULT_ALPHA: usize = 3;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

/// Tunables for a [`crate::Kademlia`] node.
///
/// Durations are (de)serialized as milliseconds. Every field has a default,
/// so a partial JSON document is enough:
///
/// ```
/// let config: kad_sdht::DhtConfig = serde_json::from_str(r#"{ "k": 8 }"#).unwrap();
/// assert_eq!(config.k, 8);
/// assert_eq!(config.alpha, kad_sdht::config::DEFAULT_ALPHA);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and number of peers returned by FIND_NODE.
    pub k: usize,
    /// Number of peers queried in parallel per lookup round.
    pub alpha: usize,
    /// Digest used for content keys.
    pub hash_algorithm: HashAlgorithm,
    /// Lifetime of a stored value.
    #[serde(with = "duration_ms")]
    pub entry_ttl: Duration,
    /// A bucket with no lookup for this long gets refreshed.
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    /// Stored values are pushed to their neighbours this often.
    #[serde(with = "duration_ms")]
    pub replication_interval: Duration,
    /// The original publisher re-stores its values this often.
    #[serde(with = "duration_ms")]
    pub republish_interval: Duration,
    /// How long to wait for a reply before treating a peer as gone.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Period of the maintenance scheduler.
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Upper bound on FIND_NODE rounds per lookup. `1` queries only the
    /// initial `alpha` candidates.
    pub max_lookup_rounds: usize,
    /// How many self-published records are remembered for republishing.
    pub max_published_records: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            hash_algorithm: HashAlgorithm::default(),
            entry_ttl: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(60 * 60),
            replication_interval: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(24 * 60 * 60),
            rpc_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_secs(60),
            max_lookup_rounds: 8,
            max_published_records: 10_000,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("k", self.k == 0),
            ("alpha", self.alpha == 0),
            ("rpc_timeout", self.rpc_timeout.is_zero()),
            ("tick_interval", self.tick_interval.is_zero()),
            ("max_lookup_rounds", self.max_lookup_rounds == 0),
            ("max_published_records", self.max_published_records == 0),
        ];
        match checks.into_iter().find(|(_, bad)| *bad) {
            Some((field, _)) => Err(ConfigError::Zero(field)),
            None => Ok(()),
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings file for the `kad-sdht` binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub dht: DhtConfig,
    /// Seed peers pinged on start-up.
    pub bootstrap: Vec<Node>,
}

impl NodeSettings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings.dht.validate()?;
        Ok(settings)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
