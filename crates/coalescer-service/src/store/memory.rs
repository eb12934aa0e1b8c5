use async_trait::async_trait;

use super::{MemoryStoreConfig, StoreError, ValueStore};

/// An in-process [`ValueStore`] backed by a [`moka`] cache.
///
/// Values are kept as-is, without any serialization, and expire after the configured time to
/// live. Reads never fail.
pub struct MemoryStore<V> {
    cache: moka::future::Cache<String, V>,
}

impl<V> std::fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("ttl", &self.cache.policy().time_to_live())
            .finish()
    }
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an unbounded store whose values never expire.
    pub fn new() -> Self {
        Self::from_config(&MemoryStoreConfig::default())
    }

    pub fn from_config(config: &MemoryStoreConfig) -> Self {
        let mut builder = moka::future::Cache::builder().name("coalescer-memory-store");
        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }
        if let Some(capacity) = config.capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            cache: builder.build(),
        }
    }

    /// Returns the number of stored values.
    ///
    /// This is an approximation, as moka applies pending evictions lazily.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl<V> Default for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> ValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, key: &str, value: V) -> Result<bool, StoreError> {
        self.cache.insert(key.to_owned(), value).await;
        Ok(true)
    }
}
