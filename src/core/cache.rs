//! Cache store abstractions

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A byte-oriented key-value collection with optional per-entry expiry.
///
/// Backends never fail loudly: read errors behave like a miss and write
/// errors are logged and dropped, so a broken cache degrades to no cache.
#[async_trait]
pub trait KeyValueCollection: Send + Sync {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    async fn put(&self, key: &[u8], value: &[u8], ttl: Option<Duration>);
    async fn remove(&self, key: &[u8]);
    async fn clear(&self);

    /// Drops every expired entry and returns how many went.
    async fn purge_expired(&self) -> usize {
        0
    }
}

/// Owner of named collections.
pub trait Store: Send + Sync {
    /// Returns the collection called `name`, creating it when
    /// `create_if_missing` is set. `persist` selects the disk backend.
    fn get_collection(
        &self,
        name: &str,
        persist: bool,
        create_if_missing: bool,
    ) -> Option<Arc<dyn KeyValueCollection>>;

    fn remove_collection(&self, name: &str) -> bool;
}
