//! Disk Tier
//!
//! Warm tier that survives restarts.
//!
//! # Layout
//!
//! ```text
//! <base_dir>/<file_prefix>/
//!     metadata.json          key -> {filepath, expireTime, accessTime, createTime, hitCount, size}
//!     <uuid>.<ext>           one serialized value per entry
//! ```
//!
//! `filepath` is stored relative to the tier directory, so a tier opened through
//! a relative `base_dir` or a moved directory still recovers.
//!
//! # Design
//!
//! - The in-memory index is authoritative; every indexed entry points at a file
//!   that was fully written and renamed into place before insertion
//! - Value files and `metadata.json` are written to a temp name then renamed
//! - Capacity victims are deleted before `set` returns; every other deletion is
//!   a detached task that `close()` waits for
//! - The reaper purges expired entries and checkpoints the index when it changed

use std::collections::HashMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{now_millis, EntryMeta, Sequence};
use super::policy::{victims_needed, EvictionPolicy, PolicyKind};
use super::reaper::Reaper;
use super::serializer::{JsonSerializer, Serializer};
use super::traits::{effective_ttl, Cache, CacheStats, CacheValue};
use crate::error::{CacheError, Result};

/// Index file name inside the tier directory
pub const METADATA_FILE: &str = "metadata.json";

/// Default capacity in entries
pub const DEFAULT_DISK_MAX_SIZE: usize = 100_000;

/// Default entry lifetime
pub const DEFAULT_DISK_TTL: Duration = Duration::from_secs(60 * 60);

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Root cache directory
    pub base_dir: PathBuf,
    /// Sub-directory holding this tier's files
    pub file_prefix: String,
    /// Maximum entries (0 = unbounded)
    pub max_size: usize,
    /// Default TTL for `set` with a zero TTL
    pub ttl: Duration,
    /// Reaper and checkpoint period (zero disables both)
    pub cleanup_interval: Duration,
    /// Eviction policy
    pub policy: PolicyKind,
}

impl DiskConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding values and metadata
    pub fn dir(&self) -> PathBuf {
        self.base_dir.join(&self.file_prefix)
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("layercache"),
            file_prefix: "cache".to_string(),
            max_size: DEFAULT_DISK_MAX_SIZE,
            ttl: DEFAULT_DISK_TTL,
            cleanup_interval: Duration::from_secs(60),
            policy: PolicyKind::Lru,
        }
    }
}

/// One persisted index record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataRecord {
    filepath: PathBuf,
    expire_time: DateTime<Utc>,
    access_time: DateTime<Utc>,
    create_time: DateTime<Utc>,
    hit_count: u64,
    size: u64,
}

/// Index entry: where the value lives plus its metadata
#[derive(Debug)]
struct DiskEntry {
    path: PathBuf,
    meta: EntryMeta,
}

impl DiskEntry {
    fn record(&self, dir: &Path) -> MetadataRecord {
        let filepath = self
            .path
            .strip_prefix(dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone());
        MetadataRecord {
            filepath,
            expire_time: self.meta.expire_time(),
            access_time: self.meta.access_time(),
            create_time: self.meta.create_time(),
            hit_count: self.meta.hit_count(),
            size: self.meta.size(),
        }
    }
}

/// Read-only view of an indexed entry
#[derive(Debug, Clone)]
pub struct DiskEntryInfo {
    pub key: String,
    pub path: PathBuf,
    pub create_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub hit_count: u64,
    pub size: u64,
}

/// Write `data` to a sibling temp file, then rename it over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(CacheError::io(temp, e));
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(())
}

async fn remove_value_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to delete cache file: {}", e),
    }
}

/// State shared with the reaper task
struct Shared<S> {
    dir: PathBuf,
    metadata_path: PathBuf,
    index: RwLock<HashMap<String, DiskEntry>>,
    policy: Arc<dyn EvictionPolicy>,
    serializer: S,
    seq: Sequence,
    max_size: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    /// Index changed since the last checkpoint
    dirty: AtomicBool,
    closed: AtomicBool,
    last_cleanup: RwLock<Option<DateTime<Utc>>>,
    deletions: TaskTracker,
    /// Serializes checkpoints so an older snapshot never lands last
    checkpointing: tokio::sync::Mutex<()>,
}

impl<S: Serializer> Shared<S> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Delete a value file in the background
    fn schedule_delete(&self, path: PathBuf) {
        self.deletions.spawn(async move {
            remove_value_file(&path).await;
        });
    }

    /// Remove `key` if it is still expired, scheduling its file for deletion
    fn expire(&self, key: &str) {
        let removed = {
            let mut index = self.index.write();
            if index.get(key).is_some_and(|e| e.meta.is_expired()) {
                self.policy.on_remove(key);
                index.remove(key)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.mark_dirty();
            debug!(tier = "disk", key, "expired on read");
            self.schedule_delete(entry.path);
        }
    }

    /// Insert a freshly written entry, evicting first when at capacity.
    ///
    /// Returns the victims' files and the replaced entry, if any.
    fn insert(&self, key: &str, entry: DiskEntry) -> Result<(Vec<PathBuf>, Option<DiskEntry>)> {
        let mut index = self.index.write();
        // Checked under the lock `close` takes before its final checkpoint
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let mut victims = Vec::new();

        if !index.contains_key(key) && victims_needed(index.len(), self.max_size) > 0 {
            for victim in self.policy.should_evict(index.len(), self.max_size) {
                if let Some(evicted) = index.remove(&victim) {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(tier = "disk", key = %victim, "evicted");
                    victims.push(evicted.path);
                }
                self.policy.on_remove(&victim);
            }
            if victims_needed(index.len(), self.max_size) > 0 {
                if !victims.is_empty() {
                    self.mark_dirty();
                }
                for path in victims {
                    self.schedule_delete(path);
                }
                return Err(CacheError::Full {
                    size: index.len(),
                    max_size: self.max_size,
                });
            }
        }

        self.policy.on_add(key, &entry.meta);
        let replaced = index.insert(key.to_string(), entry);
        self.mark_dirty();
        Ok((victims, replaced))
    }

    fn purge_expired(&self) -> usize {
        let now = now_millis();
        let expired: Vec<String> = self
            .index
            .read()
            .iter()
            .filter(|(_, entry)| entry.meta.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::new();
        if !expired.is_empty() {
            let mut index = self.index.write();
            for key in &expired {
                if index.get(key).is_some_and(|e| e.meta.is_expired()) {
                    self.policy.on_remove(key);
                    if let Some(entry) = index.remove(key) {
                        removed.push(entry.path);
                    }
                }
            }
        }

        let count = removed.len();
        for path in removed {
            self.schedule_delete(path);
        }
        if count > 0 {
            self.expirations.fetch_add(count as u64, Ordering::Relaxed);
            self.mark_dirty();
            debug!(tier = "disk", removed = count, "purged expired entries");
        }
        *self.last_cleanup.write() = Some(Utc::now());
        count
    }

    /// Persist the index to `metadata.json`
    async fn checkpoint(&self) -> Result<usize> {
        let _checkpointing = self.checkpointing.lock().await;
        self.dirty.store(false, Ordering::Release);
        let snapshot: HashMap<String, MetadataRecord> = self
            .index
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record(&self.dir)))
            .collect();

        let result = match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => write_atomic(&self.metadata_path, &data).await,
            Err(e) => Err(e.into()),
        };

        if result.is_err() {
            self.mark_dirty();
        }
        result.map(|_| snapshot.len())
    }

    /// One reaper tick
    async fn sweep(&self) {
        self.purge_expired();
        if self.dirty.load(Ordering::Acquire) {
            match self.checkpoint().await {
                Ok(entries) => debug!(tier = "disk", entries, "metadata checkpointed"),
                Err(e) => warn!(tier = "disk", "metadata checkpoint failed: {}", e),
            }
        }
    }
}

/// Outcome of reading `metadata.json`
#[derive(Default)]
struct LoadedIndex {
    /// Usable records, oldest access first
    live: Vec<(String, MetadataRecord)>,
    /// Files of expired records
    stale: Vec<PathBuf>,
    /// Records found in the file
    total: usize,
}

/// Parse `metadata.json` with file paths resolved against `dir`.
///
/// A missing file is an empty index.
async fn read_records(dir: &Path) -> Result<HashMap<String, MetadataRecord>> {
    let metadata_path = dir.join(METADATA_FILE);
    let raw = match tokio::fs::read(&metadata_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(CacheError::io(metadata_path, e)),
    };

    let mut records: HashMap<String, MetadataRecord> =
        serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupted {
            path: metadata_path.clone(),
            reason: e.to_string(),
        })?;
    for record in records.values_mut() {
        if record.filepath.is_relative() {
            record.filepath = dir.join(&record.filepath);
        }
    }
    Ok(records)
}

/// List the persisted index of the tier described by `config` without
/// opening it. Nothing on disk is created, modified or deleted. Expired
/// entries are included; sorted by access time, oldest first, then key.
pub async fn read_index(config: &DiskConfig) -> Result<Vec<DiskEntryInfo>> {
    let mut entries: Vec<DiskEntryInfo> = read_records(&config.dir())
        .await?
        .into_iter()
        .map(|(key, record)| DiskEntryInfo {
            key,
            path: record.filepath,
            create_time: record.create_time,
            access_time: record.access_time,
            expire_time: record.expire_time,
            hit_count: record.hit_count,
            size: record.size,
        })
        .collect();
    entries.sort_by(|a, b| {
        a.access_time
            .cmp(&b.access_time)
            .then_with(|| a.key.cmp(&b.key))
    });
    Ok(entries)
}

async fn load_metadata(dir: &Path) -> Result<LoadedIndex> {
    let records = read_records(dir).await?;

    let total = records.len();
    let now = Utc::now();
    let mut live = Vec::with_capacity(total);
    let mut stale = Vec::new();
    for (key, record) in records {
        if record.expire_time < now {
            stale.push(record.filepath);
            continue;
        }
        match tokio::fs::try_exists(&record.filepath).await {
            Ok(true) => live.push((key, record)),
            _ => warn!(
                key = %key,
                path = %record.filepath.display(),
                "dropping index entry with missing value file"
            ),
        }
    }

    live.sort_by(|a, b| a.1.access_time.cmp(&b.1.access_time));
    Ok(LoadedIndex { live, stale, total })
}

/// Disk cache tier, generic over the value encoding
pub struct DiskCache<V, S = JsonSerializer> {
    shared: Arc<Shared<S>>,
    reaper: Reaper,
    _value: PhantomData<fn() -> V>,
}

impl<V, S> std::fmt::Debug for DiskCache<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache").finish_non_exhaustive()
    }
}

impl<V> DiskCache<V, JsonSerializer>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Open (or create) a JSON-encoded tier and recover its index
    pub async fn open(config: DiskConfig) -> Result<Self> {
        Self::open_with_serializer(config, JsonSerializer).await
    }
}

impl<V, S> DiskCache<V, S>
where
    V: CacheValue + Serialize + DeserializeOwned,
    S: Serializer,
{
    pub async fn open_with_serializer(config: DiskConfig, serializer: S) -> Result<Self> {
        let dir = config.dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        let metadata_path = dir.join(METADATA_FILE);

        let LoadedIndex { live, stale, total } = load_metadata(&dir).await?;

        let shared = Arc::new(Shared {
            dir,
            metadata_path,
            index: RwLock::new(HashMap::with_capacity(live.len())),
            policy: config.policy.build(),
            serializer,
            seq: Sequence::new(),
            max_size: config.max_size,
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_cleanup: RwLock::new(None),
            deletions: TaskTracker::new(),
            checkpointing: tokio::sync::Mutex::new(()),
        });

        let recovered = {
            let mut index = shared.index.write();
            for (key, record) in live {
                let meta = EntryMeta::restore(
                    record.create_time,
                    record.access_time,
                    record.expire_time,
                    record.hit_count,
                    record.size,
                    shared.seq.next(),
                );
                shared.policy.on_add(&key, &meta);
                index.insert(
                    key,
                    DiskEntry {
                        path: record.filepath,
                        meta,
                    },
                );
            }

            // A smaller max_size than the previous run trims least valuable first
            let mut trimmed = Vec::new();
            if shared.max_size > 0 && index.len() > shared.max_size {
                let excess = index.len() - shared.max_size;
                for victim in shared
                    .policy
                    .should_evict(index.len(), shared.max_size)
                    .into_iter()
                    .take(excess)
                {
                    if let Some(entry) = index.remove(&victim) {
                        trimmed.push(entry.path);
                    }
                    shared.policy.on_remove(&victim);
                }
            }
            for path in trimmed {
                shared.schedule_delete(path);
            }
            index.len()
        };

        for path in stale {
            shared.schedule_delete(path);
        }
        if recovered != total {
            shared.mark_dirty();
        }

        let sweeper = shared.clone();
        let reaper = Reaper::spawn("disk", config.cleanup_interval, move || {
            let shared = sweeper.clone();
            async move { shared.sweep().await }
        });

        info!(
            dir = %shared.dir.display(),
            recovered,
            dropped = total - recovered,
            policy = shared.policy.name(),
            "disk cache opened"
        );

        Ok(Self {
            shared,
            reaper,
            _value: PhantomData,
        })
    }

    /// Tier directory
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn len(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` holds a live entry. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.shared
            .index
            .read()
            .get(key)
            .is_some_and(|e| !e.meta.is_expired())
    }

    /// Snapshot of live index entries, oldest access first
    pub fn entries(&self) -> Vec<DiskEntryInfo> {
        let mut entries: Vec<DiskEntryInfo> = self
            .shared
            .index
            .read()
            .iter()
            .filter(|(_, e)| !e.meta.is_expired())
            .map(|(key, e)| DiskEntryInfo {
                key: key.clone(),
                path: e.path.clone(),
                create_time: e.meta.create_time(),
                access_time: e.meta.access_time(),
                expire_time: e.meta.expire_time(),
                hit_count: e.meta.hit_count(),
                size: e.meta.size(),
            })
            .collect();
        entries.sort_by(|a, b| a.access_time.cmp(&b.access_time));
        entries
    }

    /// Remove every expired entry now
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    /// Persist the index immediately
    pub async fn sync(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let entries = self.shared.checkpoint().await?;
        debug!(tier = "disk", entries, "metadata synced");
        Ok(())
    }

    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.shared.expirations.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<V, S> Cache<V> for DiskCache<V, S>
where
    V: CacheValue + Serialize + DeserializeOwned,
    S: Serializer,
{
    fn name(&self) -> &str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<V> {
        let shared = &self.shared;
        shared.ensure_open()?;

        // A read racing an overwrite or delete of the same key retries
        // against the fresh index
        loop {
            let lookup = shared
                .index
                .read()
                .get(key)
                .map(|e| (e.path.clone(), e.meta.is_expired()));

            let path = match lookup {
                None => {
                    shared.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(CacheError::miss(key));
                }
                Some((_, true)) => {
                    shared.expire(key);
                    shared.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(CacheError::miss(key));
                }
                Some((path, false)) => path,
            };

            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let moved = shared
                        .index
                        .read()
                        .get(key)
                        .map_or(true, |entry| entry.path != path);
                    if moved {
                        continue;
                    }
                    return Err(CacheError::io(path, e));
                }
                Err(e) => return Err(CacheError::io(path, e)),
            };
            let value: V = shared.serializer.deserialize(&data)?;

            {
                let index = shared.index.read();
                if let Some(entry) = index.get(key).filter(|entry| entry.path == path) {
                    entry.meta.record_access(shared.seq.next());
                    shared.policy.on_access(key, &entry.meta);
                }
            }
            shared.hits.fetch_add(1, Ordering::Relaxed);
            shared.mark_dirty();
            return Ok(value);
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;
        let ttl = effective_ttl(ttl, shared.ttl);

        let data = shared.serializer.serialize(&value)?;
        let path = shared.dir.join(format!(
            "{}.{}",
            Uuid::new_v4().simple(),
            shared.serializer.extension()
        ));
        write_atomic(&path, &data).await?;

        let entry = DiskEntry {
            path: path.clone(),
            meta: EntryMeta::new(ttl, data.len() as u64, shared.seq.next()),
        };
        let (victims, replaced) = match shared.insert(key, entry) {
            Ok(outcome) => outcome,
            Err(e) => {
                remove_value_file(&path).await;
                return Err(e);
            }
        };
        for victim in victims {
            remove_value_file(&victim).await;
        }
        if let Some(old) = replaced {
            shared.schedule_delete(old.path);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let removed = {
            let mut index = shared.index.write();
            if shared.closed.load(Ordering::Acquire) {
                return Err(CacheError::Closed);
            }
            let removed = index.remove(key);
            if removed.is_some() {
                shared.policy.on_remove(key);
            }
            removed
        };
        if let Some(entry) = removed {
            shared.mark_dirty();
            shared.schedule_delete(entry.path);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let drained = {
            let mut index = shared.index.write();
            if shared.closed.load(Ordering::Acquire) {
                return Err(CacheError::Closed);
            }
            shared.policy.clear();
            std::mem::take(&mut *index)
        };
        for (_, entry) in drained {
            shared.schedule_delete(entry.path);
        }
        shared.hits.store(0, Ordering::Relaxed);
        shared.misses.store(0, Ordering::Relaxed);
        shared.mark_dirty();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        CacheStats {
            size: shared.index.read().len(),
            max_size: shared.max_size,
            hit_count: shared.hits.load(Ordering::Relaxed),
            miss_count: shared.misses.load(Ordering::Relaxed),
            ttl: shared.ttl,
            last_cleanup: *shared.last_cleanup.read(),
        }
    }

    async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        {
            // Writers check the flag under this lock, so nothing lands in the
            // index after the final checkpoint
            let _index = shared.index.write();
            if shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.reaper.stop().await;

        let persisted = shared.checkpoint().await;

        shared.deletions.close();
        shared.deletions.wait().await;

        let entries = persisted?;
        info!(dir = %shared.dir.display(), entries, "disk cache closed");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
