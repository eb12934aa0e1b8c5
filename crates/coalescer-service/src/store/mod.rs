//! Value stores backing the [`RequestCoordinator`](crate::coordinator::RequestCoordinator).
//!
//! The coordinator only ever sees the [`ValueStore`] contract: a value is either present or
//! absent, and reading or writing it may fail. Everything else, like serialization, expiry,
//! eviction and transport, is the business of the concrete store:
//!
//! - [`MemoryStore`]: an in-process [`moka`] cache with an optional time to live.
//! - [`FilesystemStore`]: JSON files in a hashed directory layout, expired by modification time.
//! - [`RedisStore`]: JSON values in redis, expired via `SET .. EX`.
//!
//! Fingerprints double as store keys, so coordinators sharing a store and a request name will
//! observe each other's cached values.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

mod config;
mod fs;
mod memory;
mod redis;

pub use config::{FilesystemStoreConfig, MemoryStoreConfig, RedisStoreConfig, StoreConfig};
pub use fs::{CleanupStats, FilesystemStore};
pub use memory::MemoryStore;
pub use redis::RedisStore;

/// An error talking to a [`ValueStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached, or refused the operation.
    ///
    /// The attached string contains the backend's error message.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The stored payload could not be decoded into, or encoded from, the expected value type.
    #[error("malformed: {0}")]
    Malformed(String),
    /// A local I/O operation of the store failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "Value store I/O failed");
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "Failed to (de)serialize stored value");
        Self::Malformed(err.to_string())
    }
}

impl From<::redis::RedisError> for StoreError {
    #[track_caller]
    fn from(err: ::redis::RedisError) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "Redis operation failed");
        Self::Unavailable(err.to_string())
    }
}

/// Asynchronous key-value persistence consumed by the coordinator.
///
/// Keys are request fingerprints. Implementations are free to expire or evict entries at any
/// time, the coordinator will simply see them as absent.
#[async_trait]
pub trait ValueStore<V>: Send + Sync + 'static {
    /// Returns the value stored under `key`, or `None` if it was never stored, has expired, or
    /// was evicted.
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError>;

    /// Stores `value` under `key`, overwriting any prior value.
    ///
    /// The returned flag is informational only.
    async fn set(&self, key: &str, value: V) -> Result<bool, StoreError>;
}

/// A shareable, type erased [`ValueStore`].
pub type StoreRef<V> = Arc<dyn ValueStore<V>>;

#[async_trait]
impl<V, S> ValueStore<V> for Arc<S>
where
    V: Send + 'static,
    S: ValueStore<V> + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: V) -> Result<bool, StoreError> {
        (**self).set(key, value).await
    }
}
