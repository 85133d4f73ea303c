//! In-memory `CacheBackend`: a bounded mapping with per-entry TTL, lazy
//! expiry on read, and FIFO eviction at max size.
//!
//! The map itself (`DashMap`) is safe for concurrent readers/writers; the
//! insertion-order ledger needed for FIFO eviction is the one piece that
//! needs a short exclusive section, guarded with `parking_lot::Mutex`
//! following `glimbot-glimbot`'s idiom of a `parking_lot` lock around a
//! small auxiliary structure rather than locking the whole cache.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

pub struct InMemoryCache {
    max_entries: usize,
    entries: DashMap<String, Entry>,
    insertion_order: Mutex<VecDeque<String>>,
}

impl InMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
        }
    }

    fn note_insertion(&self, key: &str) {
        let mut order = self.insertion_order.lock();
        order.push_back(key.to_string());
        while self.entries.len() > self.max_entries {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|exp| Instant::now() >= exp),
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        let is_new = !self.entries.contains_key(key);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        if is_new {
            self.note_insertion(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = InMemoryCache::new(10);
        cache.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expiry_is_lazy_on_read() {
        let cache = InMemoryCache::new(10);
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fifo_eviction_drops_oldest_at_capacity() {
        let cache = InMemoryCache::new(2);
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        cache.set("b", b"2".to_vec(), None).await.unwrap();
        cache.set("c", b"3".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(cache.get("c").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = InMemoryCache::new(10);
        cache.set("k", b"v".to_vec(), None).await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
