//! Key-value persistence.
//!
//! Every piece of subject state (chunks, insights, schedule metadata,
//! progress, delivery markers, metric records) is stored as JSON under a
//! logical key from [`keys`] with an explicit time-to-live.

pub mod keys;
pub mod memory;
pub mod retry;
pub mod sqlite;

pub use memory::MemoryStore;
pub use retry::retry_transient;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Opaque TTL store.
///
/// Connectivity failures surface as [`crate::Error::Store`] or
/// [`crate::Error::DatabaseSqlx`], both of which are transient.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short name of the backend, for health reports.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Live keys matching a glob pattern (`*` and `?`), sorted.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;

    /// Physically remove expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Typed JSON helpers over any [`KeyValueStore`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, ttl: Duration, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_with_ttl(key, ttl, &raw).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
