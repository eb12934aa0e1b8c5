use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{RedisStoreConfig, StoreError, ValueStore};

/// A [`ValueStore`] keeping JSON encoded values in redis.
///
/// The underlying [`ConnectionManager`] multiplexes all operations over a single connection and
/// transparently reconnects when that connection breaks.
#[derive(Clone)]
pub struct RedisStore<V> {
    connection: ConnectionManager,
    ttl: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for RedisStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<V> RedisStore<V> {
    /// Connects to the redis server at the configured URL.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis value store");

        Ok(Self {
            connection,
            ttl: config.ttl,
            _value: PhantomData,
        })
    }

    /// The expiry in whole seconds, as redis wants it.
    fn expiry_secs(&self) -> Option<u64> {
        self.ttl.map(expiry_secs)
    }
}

fn expiry_secs(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.max(1)
}

#[async_trait]
impl<V> ValueStore<V> for RedisStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let mut connection = self.connection.clone();
        let payload: Option<String> = connection.get(key).await?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: V) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(&value)?;
        let mut connection = self.connection.clone();

        match self.expiry_secs() {
            Some(secs) => connection.set_ex::<_, _, ()>(key, payload, secs).await?,
            None => connection.set::<_, _, ()>(key, payload).await?,
        }

        Ok(true)
    }
}
