//! Response caching: memory L1, optional disk L2, and the hybrid facade
//! the pipeline talks to.

mod disk;
mod entry;
mod memory;

use std::time::SystemTime;

use bytes::Bytes;
use http::HeaderMap;

pub use disk::{DiskCache, DiskCacheConfig, DiskPutMeta, DiskRecord};
pub use entry::CacheEntry;
pub use memory::{MemoryCache, MemoryCacheConfig};

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Nothing cached for this key.
    Miss,
    /// A fresh entry that can be served without touching the transport.
    Fresh(CacheEntry),
    /// A stale entry carrying validators; send a conditional request.
    Stale(CacheEntry),
}

/// L1 memory in front of an optional L2 disk store.
///
/// Reads check memory first; a disk hit is promoted into memory before it
/// is returned. Writes and invalidations go to both layers.
#[derive(Debug)]
pub struct HybridCache {
    memory: MemoryCache,
    disk: Option<DiskCache>,
}

impl HybridCache {
    /// A memory-only cache.
    #[must_use]
    pub fn memory_only(config: MemoryCacheConfig) -> Self {
        Self { memory: MemoryCache::new(config), disk: None }
    }

    /// A two-level cache.
    #[must_use]
    pub fn new(memory: MemoryCacheConfig, disk: DiskCache) -> Self {
        Self { memory: MemoryCache::new(memory), disk: Some(disk) }
    }

    /// Looks `key` up across both layers, promoting disk hits to memory.
    pub async fn lookup(&self, key: &str, now: SystemTime) -> CacheLookup {
        match self.memory.lookup(key, now).await {
            CacheLookup::Miss => {}
            hit => return hit,
        }

        let Some(disk) = &self.disk else { return CacheLookup::Miss };
        let record = match disk.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return CacheLookup::Miss,
            Err(err) => {
                log::warn!("disk cache read failed for {key}: {err}");
                return CacheLookup::Miss;
            }
        };

        // The disk layer keeps bodies and validators only; a promoted
        // entry reads back as a bare 200.
        let entry = CacheEntry {
            body: record.body,
            headers: Vec::new(),
            status: 200,
            stored_at: record.stored_at,
            expires_at: record.expires_at,
            etag: record.etag,
            last_modified: record.last_modified,
            last_accessed_at: now,
        };

        if entry.is_fresh(now) {
            self.memory.store(key.to_owned(), entry.clone()).await;
            CacheLookup::Fresh(entry)
        } else if entry.can_revalidate() {
            self.memory.store(key.to_owned(), entry.clone()).await;
            CacheLookup::Stale(entry)
        } else {
            if let Err(err) = disk.invalidate(key).await {
                log::warn!("disk cache invalidate failed for {key}: {err}");
            }
            CacheLookup::Miss
        }
    }

    /// Stores an entry in both layers.
    pub async fn store(&self, key: &str, entry: CacheEntry) {
        self.memory.store(key.to_owned(), entry.clone()).await;
        if let Some(disk) = &self.disk {
            let meta = DiskPutMeta {
                stored_at: entry.stored_at,
                expires_at: entry.expires_at,
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
            };
            match disk.put(key, &entry.body, meta).await {
                Ok(_) => {}
                Err(err) => {
                    log::warn!("disk cache write failed for {key}: {err}");
                }
            }
        }
    }

    /// Applies a 304 revalidation to both layers, returning the refreshed
    /// entry when one was cached.
    pub async fn revalidate(
        &self,
        key: &str,
        fresh_headers: &HeaderMap,
        fallback: &CacheEntry,
        now: SystemTime,
    ) -> CacheEntry {
        let refreshed = self.memory.revalidate(key, fresh_headers, now).await;
        let entry = refreshed.unwrap_or_else(|| {
            let mut entry = fallback.clone();
            entry.revalidated(fresh_headers, now);
            entry
        });
        if let Some(disk) = &self.disk {
            let meta = DiskPutMeta {
                stored_at: entry.stored_at,
                expires_at: entry.expires_at,
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
            };
            disk.revalidate(key, &meta).await;
        }
        entry
    }

    /// Removes `key` from both layers.
    pub async fn invalidate(&self, key: &str) {
        self.memory.invalidate(key).await;
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.invalidate(key).await {
                log::warn!("disk cache invalidate failed for {key}: {err}");
            }
        }
    }

    /// Empties both layers.
    pub async fn clear(&self) {
        self.memory.clear().await;
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.clear().await {
                log::warn!("disk cache clear failed: {err}");
            }
        }
    }

    /// Drops expired, unrevalidatable entries from both layers.
    pub async fn sweep_expired(&self, now: SystemTime) {
        self.memory.sweep_expired(now).await;
        if let Some(disk) = &self.disk {
            disk.sweep_expired(now).await;
        }
    }

    /// Forces the disk index to durable storage; memory-only caches return
    /// immediately.
    pub async fn flush(&self) {
        if let Some(disk) = &self.disk {
            disk.flush().await;
        }
    }
}

/// Convenience constructor for an entry from response parts; `None` when
/// the response is not cacheable.
pub(crate) fn entry_from_response(
    status: u16,
    headers: &HeaderMap,
    body: &Bytes,
    endpoint_ttl: Option<std::time::Duration>,
    now: SystemTime,
) -> Option<CacheEntry> {
    CacheEntry::from_response(status, headers, body.clone(), endpoint_ttl, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(body: &str, ttl: Duration, now: SystemTime) -> CacheEntry {
        CacheEntry {
            body: Bytes::from(body.to_owned()),
            headers: Vec::new(),
            status: 200,
            stored_at: now,
            expires_at: now + ttl,
            etag: Some("\"v1\"".to_owned()),
            last_modified: None,
            last_accessed_at: now,
        }
    }

    async fn hybrid(dir: &TempDir) -> HybridCache {
        let disk = DiskCache::open(DiskCacheConfig {
            coalesce_interval: Duration::from_millis(10),
            ..DiskCacheConfig::new(dir.path().to_path_buf())
        })
        .await
        .unwrap();
        HybridCache::new(MemoryCacheConfig::default(), disk)
    }

    #[tokio::test]
    async fn writes_land_in_both_layers() {
        let dir = TempDir::new().unwrap();
        let cache = hybrid(&dir).await;
        let now = SystemTime::now();
        cache.store("k", entry("body", Duration::from_secs(60), now)).await;

        assert_eq!(cache.memory.len().await, 1);
        assert!(cache.disk.as_ref().unwrap().get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disk_hits_are_promoted_to_memory() {
        let dir = TempDir::new().unwrap();
        let cache = hybrid(&dir).await;
        let now = SystemTime::now();
        cache.store("k", entry("body", Duration::from_secs(60), now)).await;
        cache.memory.clear().await;
        assert_eq!(cache.memory.len().await, 0);

        match cache.lookup("k", now).await {
            CacheLookup::Fresh(found) => assert_eq!(&found.body[..], b"body"),
            other => panic!("expected fresh disk hit, got {other:?}"),
        }
        assert_eq!(cache.memory.len().await, 1, "hit was promoted");
    }

    #[tokio::test]
    async fn stale_disk_entry_with_validators_surfaces_for_revalidation() {
        let dir = TempDir::new().unwrap();
        let cache = hybrid(&dir).await;
        let now = SystemTime::now();
        cache.store("k", entry("body", Duration::from_secs(1), now)).await;
        cache.memory.clear().await;

        let later = now + Duration::from_secs(10);
        match cache.lookup("k", later).await {
            CacheLookup::Stale(found) => {
                assert_eq!(found.etag.as_deref(), Some("\"v1\""));
            }
            other => panic!("expected stale hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidation_reaches_both_layers() {
        let dir = TempDir::new().unwrap();
        let cache = hybrid(&dir).await;
        let now = SystemTime::now();
        cache.store("k", entry("body", Duration::from_secs(60), now)).await;
        cache.invalidate("k").await;

        assert!(matches!(cache.lookup("k", now).await, CacheLookup::Miss));
        assert!(cache.disk.as_ref().unwrap().get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_only_cache_works_without_disk() {
        let cache = HybridCache::memory_only(MemoryCacheConfig::default());
        let now = SystemTime::now();
        cache.store("k", entry("body", Duration::from_secs(60), now)).await;
        assert!(matches!(
            cache.lookup("k", now).await,
            CacheLookup::Fresh(_)
        ));
        cache.flush().await;
    }
}
