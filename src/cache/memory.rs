//! The in-memory response cache.
//!
//! A bounded map with strict least-recently-used eviction keyed on
//! `last_accessed_at`. Both an entry-count bound and a total-byte budget
//! apply; eviction removes the least recently accessed entries first, so a
//! fresh hit is never evicted while a less recently used entry remains.

use std::time::SystemTime;

use lru::LruCache;
use tokio::sync::Mutex;

use super::entry::CacheEntry;
use super::CacheLookup;

/// Bounds for the memory cache.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total body bytes across all entries.
    pub max_total_bytes: u64,
    /// Largest single body accepted.
    pub per_entry_limit: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            max_total_bytes: 8 * 1024 * 1024,
            per_entry_limit: 1024 * 1024,
        }
    }
}

struct MemoryCacheInner {
    entries: LruCache<String, CacheEntry>,
    total_bytes: u64,
}

/// A serialized in-memory cache of responses.
pub struct MemoryCache {
    config: MemoryCacheConfig,
    inner: Mutex<MemoryCacheInner>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("config", &self.config).finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl MemoryCache {
    /// Creates a cache with the given bounds.
    #[must_use]
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(MemoryCacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    /// Looks up `key`, classifying the entry's freshness at `now`.
    ///
    /// An expired entry without validators is discarded and reported as a
    /// miss; with validators it is returned for revalidation. Any hit
    /// refreshes the entry's access time.
    pub async fn lookup(&self, key: &str, now: SystemTime) -> CacheLookup {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(key) else {
            return CacheLookup::Miss;
        };
        if entry.is_fresh(now) {
            entry.touch(now);
            return CacheLookup::Fresh(entry.clone());
        }
        if entry.can_revalidate() {
            entry.touch(now);
            return CacheLookup::Stale(entry.clone());
        }
        let size = entry.size() as u64;
        inner.entries.pop(key);
        inner.total_bytes -= size;
        CacheLookup::Miss
    }

    /// Inserts an entry, evicting the least recently used entries until the
    /// bounds hold. Returns `false` when the body alone exceeds the
    /// per-entry limit and nothing is stored.
    pub async fn store(&self, key: String, entry: CacheEntry) -> bool {
        if entry.size() > self.config.per_entry_limit {
            log::debug!(
                "memory cache refused {key}: {} bytes over per-entry limit",
                entry.size()
            );
            return false;
        }
        let mut inner = self.inner.lock().await;
        let incoming = entry.size() as u64;
        if let Some(previous) = inner.entries.put(key, entry) {
            inner.total_bytes -= previous.size() as u64;
        }
        inner.total_bytes += incoming;

        while inner.entries.len() > self.config.max_entries
            || inner.total_bytes > self.config.max_total_bytes
        {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.total_bytes -= evicted.size() as u64;
                    log::trace!("memory cache evicted {evicted_key}");
                }
                None => break,
            }
        }
        true
    }

    /// Applies a 304 revalidation to the stored entry, when present.
    pub async fn revalidate(
        &self,
        key: &str,
        fresh_headers: &http::HeaderMap,
        now: SystemTime,
    ) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(key)?;
        entry.revalidated(fresh_headers, now);
        Some(entry.clone())
    }

    /// Removes one entry.
    pub async fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_bytes -= entry.size() as u64;
        }
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    /// Drops expired entries that carry no validators.
    pub async fn sweep_expired(&self, now: SystemTime) {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now) && !entry.can_revalidate())
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.total_bytes -= entry.size() as u64;
            }
        }
    }

    /// Current entry count.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current total of cached body bytes.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn entry(body: &str, ttl: Duration, now: SystemTime) -> CacheEntry {
        CacheEntry {
            body: Bytes::from(body.to_owned()),
            headers: Vec::new(),
            status: 200,
            stored_at: now,
            expires_at: now + ttl,
            etag: None,
            last_modified: None,
            last_accessed_at: now,
        }
    }

    fn entry_with_etag(
        body: &str,
        ttl: Duration,
        now: SystemTime,
    ) -> CacheEntry {
        let mut e = entry(body, ttl, now);
        e.etag = Some("\"v1\"".to_owned());
        e
    }

    #[tokio::test]
    async fn fresh_hit_and_miss() {
        let cache = MemoryCache::default();
        let now = SystemTime::now();
        cache
            .store(
                "GET:https://a/1".into(),
                entry("hello", Duration::from_secs(60), now),
            )
            .await;

        match cache.lookup("GET:https://a/1", now).await {
            CacheLookup::Fresh(found) => assert_eq!(&found.body[..], b"hello"),
            other => panic!("expected fresh hit, got {other:?}"),
        }
        assert!(matches!(
            cache.lookup("GET:https://a/2", now).await,
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn expired_entry_with_validators_is_stale() {
        let cache = MemoryCache::default();
        let now = SystemTime::now();
        cache
            .store(
                "k".into(),
                entry_with_etag("hello", Duration::from_secs(1), now),
            )
            .await;

        let later = now + Duration::from_secs(5);
        match cache.lookup("k", later).await {
            CacheLookup::Stale(found) => {
                assert_eq!(found.etag.as_deref(), Some("\"v1\""));
            }
            other => panic!("expected stale hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_entry_without_validators_is_dropped() {
        let cache = MemoryCache::default();
        let now = SystemTime::now();
        cache
            .store("k".into(), entry("hello", Duration::from_secs(1), now))
            .await;

        let later = now + Duration::from_secs(5);
        assert!(matches!(cache.lookup("k", later).await, CacheLookup::Miss));
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn byte_budget_evicts_least_recently_used_first() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_entries: 100,
            max_total_bytes: 30,
            per_entry_limit: 10,
        });
        let now = SystemTime::now();
        let ttl = Duration::from_secs(60);

        cache.store("a".into(), entry("0123456789", ttl, now)).await;
        cache.store("b".into(), entry("0123456789", ttl, now)).await;
        // Touch `a` so `b` becomes the least recently used.
        cache.lookup("a", now).await;
        cache.store("c".into(), entry("0123456789", ttl, now)).await;
        cache.store("d".into(), entry("0123456789", ttl, now)).await;

        assert!(matches!(cache.lookup("b", now).await, CacheLookup::Miss));
        assert!(matches!(
            cache.lookup("a", now).await,
            CacheLookup::Fresh(_)
        ));
        assert!(matches!(
            cache.lookup("c", now).await,
            CacheLookup::Fresh(_)
        ));
        assert!(matches!(
            cache.lookup("d", now).await,
            CacheLookup::Fresh(_)
        ));
        assert_eq!(cache.total_bytes().await, 30);
    }

    #[tokio::test]
    async fn entry_count_bound_is_enforced() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_entries: 2,
            max_total_bytes: 1_000,
            per_entry_limit: 100,
        });
        let now = SystemTime::now();
        let ttl = Duration::from_secs(60);
        cache.store("a".into(), entry("x", ttl, now)).await;
        cache.store("b".into(), entry("y", ttl, now)).await;
        cache.store("c".into(), entry("z", ttl, now)).await;
        assert_eq!(cache.len().await, 2);
        assert!(matches!(cache.lookup("a", now).await, CacheLookup::Miss));
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_entries: 10,
            max_total_bytes: 1_000,
            per_entry_limit: 4,
        });
        let now = SystemTime::now();
        let stored = cache
            .store("k".into(), entry("too big", Duration::from_secs(60), now))
            .await;
        assert!(!stored);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn replacing_an_entry_keeps_byte_accounting_straight() {
        let cache = MemoryCache::default();
        let now = SystemTime::now();
        let ttl = Duration::from_secs(60);
        cache.store("k".into(), entry("aaaa", ttl, now)).await;
        cache.store("k".into(), entry("bb", ttl, now)).await;
        assert_eq!(cache.total_bytes().await, 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_drops_only_unrevalidatable_expired_entries() {
        let cache = MemoryCache::default();
        let now = SystemTime::now();
        cache
            .store("plain".into(), entry("x", Duration::from_secs(1), now))
            .await;
        cache
            .store(
                "tagged".into(),
                entry_with_etag("y", Duration::from_secs(1), now),
            )
            .await;
        cache
            .store("fresh".into(), entry("z", Duration::from_secs(60), now))
            .await;

        cache.sweep_expired(now + Duration::from_secs(5)).await;
        assert_eq!(cache.len().await, 2);
        assert!(matches!(
            cache.lookup("plain", now + Duration::from_secs(5)).await,
            CacheLookup::Miss
        ));
    }
}
