use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::registry::hash_url;

pub const CACHE_BUCKETS: usize = 2048;
pub const BUCKET_CAPACITY: usize = 64;

struct CacheItem {
    url: String,
    data: Bytes,
    stored: Instant,
}

/// Bucketed in-memory cache for fetched segment bodies.
///
/// Buckets are selected by url hash and locked independently; there is no
/// global lock on the lookup path. Bodies are `Bytes`, so a hit is a
/// refcount bump and eviction can never pull memory out from under an
/// in-flight response.
pub struct SegmentCache {
    buckets: Vec<Mutex<Vec<CacheItem>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SegmentCache {
    pub fn new(ttl: Duration) -> Self {
        let mut buckets = Vec::with_capacity(CACHE_BUCKETS);
        buckets.resize_with(CACHE_BUCKETS, || Mutex::new(Vec::new()));
        Self {
            buckets,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn bucket(&self, url: &str) -> &Mutex<Vec<CacheItem>> {
        &self.buckets[hash_url(url) as usize % CACHE_BUCKETS]
    }

    pub fn find(&self, url: &str) -> Option<Bytes> {
        let mut items = self.bucket(url).lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| i.url == url) {
            item.stored = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(item.data.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, url: String, data: Bytes) {
        let mut items = self.bucket(&url).lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| i.url == url) {
            item.data = data;
            item.stored = Instant::now();
            return;
        }
        if items.len() >= BUCKET_CAPACITY {
            if let Some(oldest) = items
                .iter()
                .enumerate()
                .min_by_key(|(_, i)| i.stored)
                .map(|(i, _)| i)
            {
                items.swap_remove(oldest);
            }
        }
        items.push(CacheItem {
            url,
            data,
            stored: Instant::now(),
        });
    }

    /// Drop everything older than the ttl. Called every 30 s.
    pub fn sweep(&self) {
        let now = Instant::now();
        for bucket in &self.buckets {
            let mut items = bucket.lock().unwrap();
            items.retain(|i| now.duration_since(i.stored) <= self.ttl);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let cache = SegmentCache::new(Duration::from_secs(300));
        assert!(cache.find("http://h/a.ts").is_none());
        cache.insert("http://h/a.ts".to_string(), Bytes::from_static(b"abc"));
        assert_eq!(cache.find("http://h/a.ts").unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn insert_replaces_existing_url() {
        let cache = SegmentCache::new(Duration::from_secs(300));
        cache.insert("u".to_string(), Bytes::from_static(b"one"));
        cache.insert("u".to_string(), Bytes::from_static(b"two"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.find("u").unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn sweep_drops_expired_items() {
        let cache = SegmentCache::new(Duration::from_millis(0));
        cache.insert("u".to_string(), Bytes::from_static(b"x"));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn full_bucket_evicts_oldest() {
        let cache = SegmentCache::new(Duration::from_secs(300));
        // colliding keys are irrelevant; fill one bucket by brute force
        let mut urls: Vec<String> = Vec::new();
        let target = hash_url("seed") as usize % CACHE_BUCKETS;
        let mut i = 0u64;
        while urls.len() < BUCKET_CAPACITY + 1 {
            let candidate = format!("u{}", i);
            if hash_url(&candidate) as usize % CACHE_BUCKETS == target {
                urls.push(candidate);
            }
            i += 1;
        }
        for (n, u) in urls.iter().enumerate() {
            cache.insert(u.clone(), Bytes::from_static(b"x"));
            if n == 0 {
                // make the first insert strictly the oldest
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(cache.len(), BUCKET_CAPACITY);
        assert!(cache.find(&urls[0]).is_none());
        assert!(cache.find(urls.last().unwrap()).is_some());
    }
}
