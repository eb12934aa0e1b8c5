use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{FilesystemStore, MemoryStore, RedisStore, StoreError, StoreRef};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Time after which a stored value reads as absent.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Maximum number of values kept in memory.
    ///
    /// Values beyond this capacity are evicted, least recently used first.
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemStoreConfig {
    /// Root directory of the store.
    pub path: PathBuf,

    /// Time since the last write after which a stored value reads as absent.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, like `redis://127.0.0.1:6379`.
    pub url: String,

    /// Expiry set on every written key.
    ///
    /// Redis expires keys in whole seconds, so this is rounded up to at least one second.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

/// The backend to use for caching results.
///
/// In YAML, the backend is a map with a single key naming it. Fields holding this type use
/// `serde_yaml::with::singleton_map`, since serde_yaml otherwise expects a `!tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreConfig {
    Memory(MemoryStoreConfig),
    Filesystem(FilesystemStoreConfig),
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryStoreConfig::default())
    }
}

impl StoreConfig {
    /// The name of the configured backend, used for logs and metrics.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Filesystem(_) => "filesystem",
            Self::Redis(_) => "redis",
        }
    }

    /// Creates the configured store.
    ///
    /// Stores that persist values outside of the process need `V` to be serializable, which is
    /// why this requires serde bounds even for the in-memory backend.
    pub async fn open<V>(&self) -> Result<StoreRef<V>, StoreError>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        tracing::debug!(backend = self.backend_name(), "Opening value store");
        let store: StoreRef<V> = match self {
            Self::Memory(config) => Arc::new(MemoryStore::from_config(config)),
            Self::Filesystem(config) => Arc::new(FilesystemStore::from_config(config)?),
            Self::Redis(config) => Arc::new(RedisStore::connect(config).await?),
        };
        Ok(store)
    }
}
