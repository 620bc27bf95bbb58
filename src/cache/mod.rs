//! Caching for query results.
//!
//! [`ByteCache`] is the opaque key/bytes store everything is built on;
//! [`TimeRangeCache`] keeps per-query-shape interval lists on top of it, and
//! [`keys`] derives the shape keys.

pub mod keys;
pub mod range;

pub use keys::{CacheKeyGenerator, ShapeKeyGenerator};
pub use range::{BoundaryTruncation, CachedSeriesData, MissInterval, TimeRangeCache};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Key/bytes store with per-entry TTL.
///
/// `retrieve` and `store` must each be atomic per key; nothing more is
/// assumed about locking.
#[async_trait]
pub trait ByteCache: Send + Sync {
    async fn retrieve(&self, key: &str) -> Option<Bytes>;

    /// Store `data` under `key`. A zero `ttl` selects the cache default.
    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;
}

struct Entry {
    data: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process [`ByteCache`] with TTL expiry and an entry bound.
pub struct InMemoryByteCache {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl InMemoryByteCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make room for one more entry: drop expired entries, then the one
    /// closest to expiry.
    fn evict(entries: &mut HashMap<String, Entry>, max_entries: usize, now: Instant) {
        if entries.len() < max_entries {
            return;
        }
        entries.retain(|_, e| !e.is_expired(now));
        while entries.len() >= max_entries {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryByteCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 10_000)
    }
}

#[async_trait]
impl ByteCache for InMemoryByteCache {
    async fn retrieve(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.data.clone())
    }

    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();
        let mut entries = self.entries.write();
        if !entries.contains_key(key) {
            Self::evict(&mut entries, self.max_entries, now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                data,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let cache = InMemoryByteCache::default();
        assert!(cache.retrieve("k").await.is_none());

        cache
            .store("k", Bytes::from_static(b"payload"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.retrieve("k").await.unwrap(), Bytes::from_static(b"payload"));

        cache
            .store("k", Bytes::from_static(b"replaced"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.retrieve("k").await.unwrap(), Bytes::from_static(b"replaced"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let cache = InMemoryByteCache::default();
        cache
            .store("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.retrieve("k").await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_respects_bound() {
        let cache = InMemoryByteCache::new(Duration::from_secs(60), 2);
        cache
            .store("short", Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .store("long", Bytes::from_static(b"2"), Duration::from_secs(120))
            .await
            .unwrap();
        cache
            .store("new", Bytes::from_static(b"3"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.retrieve("short").await.is_none());
        assert!(cache.retrieve("long").await.is_some());
        assert!(cache.retrieve("new").await.is_some());
    }
}
