//! The on-disk response cache.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   index.json        { "entries": { "<cache_key>": { ... } } }
//!   index.json.bak    prior successful snapshot
//!   entries/<sha-256 hex>.data
//!   version           single-line integer, "1"
//! ```
//!
//! Bodies larger than 1 KiB are zlib-compressed at store time; the index
//! records the uncompressed size, which doubles as the decompression rule
//! on read. Index persistence goes through a single writer task with write
//! coalescing: mutations schedule a write, the writer sleeps out the
//! coalesce window and persists one snapshot atomically (temp file, fsync,
//! backup, rename). [`DiskCache::flush`] forces an immediate write.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::sleep;

use std::sync::Arc;

const INDEX_FILE: &str = "index.json";
const INDEX_BACKUP: &str = "index.json.bak";
const INDEX_TEMP: &str = "index.json.tmp";
const VERSION_FILE: &str = "version";
const ENTRIES_DIR: &str = "entries";
const CACHE_VERSION: u32 = 1;

/// Bodies above this size are compressed at store time.
const COMPRESSION_THRESHOLD: u64 = 1024;

/// Bounds and tuning for the disk cache.
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// Directory the cache lives in; created if missing.
    pub root: PathBuf,
    /// Total uncompressed bytes kept across all entries.
    pub total_limit: u64,
    /// Largest single body accepted.
    pub per_entry_limit: u64,
    /// How long the index writer coalesces mutations before persisting.
    pub coalesce_interval: Duration,
}

impl DiskCacheConfig {
    /// Default bounds (50 MiB total, 5 MiB per entry, 100 ms coalescing)
    /// rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            total_limit: 50 * 1024 * 1024,
            per_entry_limit: 5 * 1024 * 1024,
            coalesce_interval: Duration::from_millis(100),
        }
    }
}

/// Metadata recorded when storing a body.
#[derive(Debug, Clone)]
pub struct DiskPutMeta {
    /// Store instant.
    pub stored_at: SystemTime,
    /// Freshness horizon.
    pub expires_at: SystemTime,
    /// Optional `ETag` validator.
    pub etag: Option<String>,
    /// Optional `Last-Modified` validator.
    pub last_modified: Option<String>,
}

/// A record read back from disk.
#[derive(Debug, Clone)]
pub struct DiskRecord {
    /// The (decompressed) body.
    pub body: Bytes,
    /// Store instant.
    pub stored_at: SystemTime,
    /// Freshness horizon.
    pub expires_at: SystemTime,
    /// Optional `ETag` validator.
    pub etag: Option<String>,
    /// Optional `Last-Modified` validator.
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DiskIndex {
    entries: HashMap<String, IndexEntry>,
}

impl DiskIndex {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    filename: String,
    /// Uncompressed body length; also the Σ-size unit for the total limit.
    size: u64,
    stored_at: u64,
    expires_at: u64,
    last_accessed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
}

enum WriterCommand {
    Schedule,
    Flush(oneshot::Sender<()>),
}

/// A compressed, LRU-evicted on-disk store with coalesced index writes.
pub struct DiskCache {
    config: DiskCacheConfig,
    index: Arc<Mutex<DiskIndex>>,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache").field("config", &self.config).finish()
    }
}

impl DiskCache {
    /// Opens (or initializes) the cache directory.
    ///
    /// A missing or corrupt `index.json` falls back to `index.json.bak`;
    /// when both are unusable the cache restarts empty and reclaims orphan
    /// data files.
    pub async fn open(config: DiskCacheConfig) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(config.root.join(ENTRIES_DIR)).await?;
        check_version(&config.root).await?;

        let (index, recovered_empty) = load_index(&config.root).await;
        if recovered_empty {
            reclaim_orphans(&config.root, &index).await;
        }

        let index = Arc::new(Mutex::new(index));
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(index_writer(
            config.root.clone(),
            Arc::clone(&index),
            config.coalesce_interval,
            rx,
        ));

        Ok(Self { config, index, writer })
    }

    /// Reads a record and refreshes its access time.
    ///
    /// Missing or unreadable data files drop the index entry and read as a
    /// miss rather than an error.
    pub async fn get(&self, key: &str) -> std::io::Result<Option<DiskRecord>> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.entries.get(key).cloned() else {
            return Ok(None);
        };

        let path = self.data_path(&entry.filename);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!(
                    "disk cache entry {key} lost its data file ({err}); dropping"
                );
                index.entries.remove(key);
                self.schedule_write();
                return Ok(None);
            }
        };

        let body = if entry.size > COMPRESSION_THRESHOLD {
            match decompress(&raw) {
                Ok(body) => body,
                Err(err) => {
                    log::warn!(
                        "disk cache entry {key} failed to decompress ({err}); dropping"
                    );
                    index.entries.remove(key);
                    let _ = tokio::fs::remove_file(&path).await;
                    self.schedule_write();
                    return Ok(None);
                }
            }
        } else {
            raw
        };

        let now = SystemTime::now();
        let record = DiskRecord {
            body: Bytes::from(body),
            stored_at: from_micros(entry.stored_at),
            expires_at: from_micros(entry.expires_at),
            etag: entry.etag.clone(),
            last_modified: entry.last_modified.clone(),
        };
        if let Some(live) = index.entries.get_mut(key) {
            live.last_accessed_at = to_micros(now);
        }
        self.schedule_write();
        Ok(Some(record))
    }

    /// Stores a body, evicting least-recently-used entries until the total
    /// limit holds. Returns `false` (storing nothing) when the body alone
    /// exceeds the per-entry limit.
    pub async fn put(
        &self,
        key: &str,
        body: &[u8],
        meta: DiskPutMeta,
    ) -> std::io::Result<bool> {
        let size = body.len() as u64;
        if size > self.config.per_entry_limit {
            log::debug!(
                "disk cache refused {key}: {size} bytes over per-entry limit"
            );
            return Ok(false);
        }

        let file_bytes = if size > COMPRESSION_THRESHOLD {
            compress(body)?
        } else {
            body.to_vec()
        };
        let filename = format!("{}.data", hex::encode(Sha256::digest(key)));

        let mut index = self.index.lock().await;

        // Make room among the other entries before admitting this one.
        let incoming_total = index.total_size()
            - index.entries.get(key).map_or(0, |existing| existing.size)
            + size;
        let mut overflow = incoming_total.saturating_sub(self.config.total_limit);
        while overflow > 0 {
            let Some((victim_key, victim)) = index
                .entries
                .iter()
                .filter(|(candidate, _)| candidate.as_str() != key)
                .min_by_key(|(_, entry)| entry.last_accessed_at)
                .map(|(k, v)| (k.clone(), v.clone()))
            else {
                break;
            };
            index.entries.remove(&victim_key);
            overflow = overflow.saturating_sub(victim.size);
            let _ =
                tokio::fs::remove_file(self.data_path(&victim.filename)).await;
            log::trace!("disk cache evicted {victim_key}");
        }

        tokio::fs::write(self.data_path(&filename), &file_bytes).await?;

        let now = to_micros(meta.stored_at);
        index.entries.insert(
            key.to_owned(),
            IndexEntry {
                filename,
                size,
                stored_at: now,
                expires_at: to_micros(meta.expires_at),
                last_accessed_at: now,
                etag: meta.etag,
                last_modified: meta.last_modified,
            },
        );
        self.schedule_write();
        Ok(true)
    }

    /// Rewrites the freshness window of an existing entry after a 304.
    pub async fn revalidate(&self, key: &str, meta: &DiskPutMeta) {
        let mut index = self.index.lock().await;
        if let Some(entry) = index.entries.get_mut(key) {
            entry.stored_at = to_micros(meta.stored_at);
            entry.expires_at = to_micros(meta.expires_at);
            entry.last_accessed_at = to_micros(meta.stored_at);
            if meta.etag.is_some() {
                entry.etag = meta.etag.clone();
            }
            if meta.last_modified.is_some() {
                entry.last_modified = meta.last_modified.clone();
            }
            self.schedule_write();
        }
    }

    /// Removes one entry and its data file.
    pub async fn invalidate(&self, key: &str) -> std::io::Result<()> {
        let mut index = self.index.lock().await;
        if let Some(entry) = index.entries.remove(key) {
            let _ =
                tokio::fs::remove_file(self.data_path(&entry.filename)).await;
            self.schedule_write();
        }
        Ok(())
    }

    /// Removes every entry and data file.
    pub async fn clear(&self) -> std::io::Result<()> {
        let mut index = self.index.lock().await;
        for entry in index.entries.values() {
            let _ =
                tokio::fs::remove_file(self.data_path(&entry.filename)).await;
        }
        index.entries.clear();
        self.schedule_write();
        Ok(())
    }

    /// Drops entries whose freshness horizon has passed and that carry no
    /// validators.
    pub async fn sweep_expired(&self, now: SystemTime) {
        let cutoff = to_micros(now);
        let mut index = self.index.lock().await;
        let doomed: Vec<(String, String)> = index
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.expires_at < cutoff
                    && entry.etag.is_none()
                    && entry.last_modified.is_none()
            })
            .map(|(key, entry)| (key.clone(), entry.filename.clone()))
            .collect();
        for (key, filename) in doomed {
            index.entries.remove(&key);
            let _ = tokio::fs::remove_file(self.data_path(&filename)).await;
        }
        self.schedule_write();
    }

    /// Forces the pending index snapshot to disk and waits for it.
    ///
    /// Call at shutdown; the coalesced writer otherwise only guarantees the
    /// final snapshot of each 100 ms window.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Sum of the uncompressed sizes of all entries.
    pub async fn total_bytes(&self) -> u64 {
        self.index.lock().await.total_size()
    }

    /// Number of entries currently indexed.
    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn schedule_write(&self) {
        let _ = self.writer.send(WriterCommand::Schedule);
    }

    fn data_path(&self, filename: &str) -> PathBuf {
        self.config.root.join(ENTRIES_DIR).join(filename)
    }
}

async fn check_version(root: &Path) -> std::io::Result<()> {
    let path = root.join(VERSION_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let parsed = contents.trim().parse::<u32>().ok();
            if parsed != Some(CACHE_VERSION) {
                log::warn!(
                    "disk cache version mismatch (found {:?}); keeping files but rewriting version",
                    contents.trim()
                );
                tokio::fs::write(&path, format!("{CACHE_VERSION}\n")).await?;
            }
        }
        Err(_) => {
            tokio::fs::write(&path, format!("{CACHE_VERSION}\n")).await?;
        }
    }
    Ok(())
}

/// Loads the index, preferring the primary and falling back to the backup.
/// The boolean is true when both were unusable and the cache starts empty.
async fn load_index(root: &Path) -> (DiskIndex, bool) {
    for (name, is_backup) in [(INDEX_FILE, false), (INDEX_BACKUP, true)] {
        match tokio::fs::read(root.join(name)).await {
            Ok(bytes) => match serde_json::from_slice::<DiskIndex>(&bytes) {
                Ok(index) => {
                    if is_backup {
                        log::warn!(
                            "disk cache index recovered from {INDEX_BACKUP}"
                        );
                    }
                    return (index, false);
                }
                Err(err) => {
                    log::warn!("disk cache {name} failed to parse: {err}");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("disk cache {name} unreadable: {err}"),
        }
    }
    (DiskIndex::default(), true)
}

/// Deletes data files not referenced by the index.
async fn reclaim_orphans(root: &Path, index: &DiskIndex) {
    let referenced: std::collections::HashSet<&str> =
        index.entries.values().map(|entry| entry.filename.as_str()).collect();
    let dir = root.join(ENTRIES_DIR);
    let Ok(mut listing) = tokio::fs::read_dir(&dir).await else {
        return;
    };
    while let Ok(Some(file)) = listing.next_entry().await {
        let name = file.file_name();
        let Some(name) = name.to_str() else { continue };
        if !referenced.contains(name) {
            log::debug!("disk cache reclaiming orphan {name}");
            let _ = tokio::fs::remove_file(file.path()).await;
        }
    }
}

/// The dedicated index writer: coalesces scheduled writes inside the
/// configured window and persists snapshots atomically.
async fn index_writer(
    root: PathBuf,
    index: Arc<Mutex<DiskIndex>>,
    coalesce_interval: Duration,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        let mut flush_acks = Vec::new();
        match command {
            WriterCommand::Flush(ack) => flush_acks.push(ack),
            WriterCommand::Schedule => {
                let window = sleep(coalesce_interval);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        () = &mut window => break,
                        next = rx.recv() => match next {
                            Some(WriterCommand::Schedule) => {}
                            Some(WriterCommand::Flush(ack)) => {
                                flush_acks.push(ack);
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
        }

        let snapshot = { index.lock().await.clone() };
        if let Err(err) = persist_index(&root, &snapshot).await {
            log::error!("disk cache index write failed: {err}");
        }
        for ack in flush_acks {
            let _ = ack.send(());
        }
    }
}

/// Atomic snapshot write: temp file, fsync, backup the previous primary,
/// rename into place.
async fn persist_index(root: &Path, index: &DiskIndex) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(index)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

    let temp = root.join(INDEX_TEMP);
    let primary = root.join(INDEX_FILE);
    let backup = root.join(INDEX_BACKUP);

    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    if tokio::fs::metadata(&primary).await.is_ok() {
        tokio::fs::copy(&primary, &backup).await?;
    }
    tokio::fs::rename(&temp, &primary).await?;
    Ok(())
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(body)?;
    encoder.finish()
}

fn decompress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(raw);
    let mut body = Vec::new();
    decoder.read_to_end(&mut body)?;
    Ok(body)
}

fn to_micros(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_micros(micros: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_micros(micros)
}
