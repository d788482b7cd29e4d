use crate::core::cache::KeyValueCollection;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct CacheValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

fn drop_expired(cache: &mut HashMap<Vec<u8>, CacheValue>, now: Instant) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| !entry.is_expired(now));
    before - cache.len()
}

/// In-memory collection using a HashMap behind an async mutex
pub struct MemoryCollection {
    inner: Mutex<HashMap<Vec<u8>, CacheValue>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueCollection for MemoryCollection {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut cache = self.inner.lock().await;
        let expired = match cache.get(key) {
            Some(entry) => entry.is_expired(Instant::now()),
            None => {
                debug!("Cache MISS for key: {}", String::from_utf8_lossy(key));
                return None;
            }
        };
        if expired {
            debug!("Cache entry expired for key: {}", String::from_utf8_lossy(key));
            cache.remove(key);
            return None;
        }
        debug!("Cache HIT for key: {}", String::from_utf8_lossy(key));
        cache.get(key).map(|entry| entry.value.clone())
    }

    async fn put(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) {
        let now = Instant::now();
        // A TTL too large to represent never expires
        let expires_at = ttl.and_then(|duration| now.checked_add(duration));
        let mut cache = self.inner.lock().await;
        let purged = drop_expired(&mut cache, now);
        debug!(purged, "Cache PUT for key: {}", String::from_utf8_lossy(key));
        cache.insert(
            key.to_vec(),
            CacheValue {
                value: value.to_vec(),
                expires_at,
            },
        );
    }

    async fn remove(&self, key: &[u8]) {
        self.inner.lock().await.remove(key);
        debug!("Cache REMOVE for key: {}", String::from_utf8_lossy(key));
    }

    async fn clear(&self) {
        self.inner.lock().await.clear();
        debug!("Cache CLEAR");
    }

    async fn purge_expired(&self) -> usize {
        let mut cache = self.inner.lock().await;
        drop_expired(&mut cache, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_cache_get_put() {
        let cache = MemoryCollection::new();

        // Initially, cache is empty
        assert!(cache.get(b"key1").await.is_none());

        cache.put(b"key1", b"123", None).await;
        assert_eq!(cache.get(b"key1").await, Some(b"123".to_vec()));

        // Get a non-existent key
        assert!(cache.get(b"key2").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_ttl_expiration() {
        let cache = MemoryCollection::new();

        cache
            .put(b"key1", b"123", Some(Duration::from_millis(10)))
            .await;
        assert_eq!(cache.get(b"key1").await, Some(b"123".to_vec()));

        // Wait for TTL expiration
        sleep(Duration::from_millis(20)).await;
        assert!(cache.get(b"key1").await.is_none());
        // Expired entries are dropped on read
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_put_drops_expired_entries() {
        let cache = MemoryCollection::new();

        for i in 0..1000 {
            cache
                .put(
                    format!("key{i}").as_bytes(),
                    b"stale",
                    Some(Duration::from_millis(1)),
                )
                .await;
        }
        sleep(Duration::from_millis(20)).await;

        cache.put(b"fresh", b"1", None).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(b"fresh").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_entries() {
        let cache = MemoryCollection::new();
        cache.put(b"stale", b"1", Some(Duration::ZERO)).await;
        cache.put(b"live", b"2", Some(Duration::from_secs(60))).await;
        cache.put(b"forever", b"3", None).await;

        // The zero TTL entry was already dropped by the later writes
        assert_eq!(cache.purge_expired().await, 0);
        assert_eq!(cache.len().await, 2);

        cache.put(b"stale", b"1", Some(Duration::ZERO)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache = MemoryCollection::new();
        cache.put(b"key1", b"1", Some(Duration::MAX)).await;
        assert_eq!(cache.get(b"key1").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_cache_overwrite_last_writer_wins() {
        let cache = MemoryCollection::new();

        cache.put(b"key1", b"first", None).await;
        cache.put(b"key1", b"second", None).await;
        assert_eq!(cache.get(b"key1").await, Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_cache_remove_and_clear() {
        let cache = MemoryCollection::new();

        cache.put(b"key1", b"1", None).await;
        cache.put(b"key2", b"2", None).await;

        cache.remove(b"key1").await;
        assert!(cache.get(b"key1").await.is_none());
        assert!(cache.get(b"key2").await.is_some());

        cache.clear().await;
        assert!(cache.get(b"key2").await.is_none());
    }
}
