//! Layer cache.
//!
//! Maps chain keys to previously produced layers. A key is derived from the
//! parent key and the instruction (plus any content it reads), so equal keys
//! mean equal filesystem results.
//!
//! On disk the cache is a directory holding `blobs/sha256/<hex>` layer
//! archives and an `index.json`. The index is loaded by [`LayerCache::open`]
//! and written back by [`LayerCache::flush`]. [`LayerCache::in_memory`] keeps
//! everything in process memory.
//!
//! Concurrent requests for the same key are coalesced: one caller computes,
//! the others wait for its result. Keys are locked independently, so unrelated
//! keys never wait on each other. Hits only take the index read lock; their
//! access times are queued per key and folded into the index on the next
//! read of the metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_common::{Digest, KilnError, KilnResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::instruction::Instruction;
use crate::snapshot::LayerArtifact;

/// Chain key: identifies the filesystem and config state after an
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Digest);

impl CacheKey {
    /// Root key of a stage built from an external image or `scratch`.
    #[must_use]
    pub fn for_base(reference: &str) -> Self {
        Self(Digest::of(format!("from:{reference}")))
    }

    /// Key after applying `instruction` on top of `self`. `material` is the
    /// digest of any content the instruction reads (COPY sources).
    #[must_use]
    pub fn chain(&self, instruction: &Instruction, material: Option<&Digest>) -> Self {
        let text = instruction.to_string();
        let material = material.map(ToString::to_string).unwrap_or_default();
        Self(Digest::of_parts([
            self.0.hex(),
            text.as_str(),
            material.as_str(),
        ]))
    }

    /// Underlying digest.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A layer archive stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Digest of the tar archive.
    pub digest: Digest,
    /// Archive size in bytes.
    pub size: u64,
    /// Canonical text of the instruction that produced it.
    pub created_by: String,
}

/// Index record for a cached layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The layer.
    pub layer: Layer,
    /// When the layer was stored.
    pub created: DateTime<Utc>,
    /// Last lookup hit.
    pub last_access: DateTime<Utc>,
}

/// How [`LayerCache::get_or_compute`] produced its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache, or from a concurrent caller's computation.
    Hit,
    /// Computed by this caller.
    Computed,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Indexed entries.
    pub entries: usize,
    /// Bytes held by distinct blobs.
    pub total_bytes: u64,
    /// Lookups served since the cache was opened.
    pub hits: u64,
    /// Computations since the cache was opened.
    pub misses: u64,
}

/// Result of [`LayerCache::evict`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Index entries removed.
    pub entries: usize,
    /// Blobs deleted.
    pub blobs: usize,
    /// Bytes reclaimed.
    pub bytes: u64,
}

enum BlobStore {
    Disk { root: PathBuf },
    Memory(RwLock<HashMap<Digest, Arc<Vec<u8>>>>),
}

struct Inner {
    blobs: BlobStore,
    index: RwLock<BTreeMap<CacheKey, CacheEntry>>,
    in_flight: DashMap<CacheKey, Arc<OnceCell<Layer>>>,
    accessed: DashMap<CacheKey, DateTime<Utc>>,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Shared handle to a layer cache. Cloning is cheap.
#[derive(Clone)]
pub struct LayerCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for LayerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match &self.inner.blobs {
            BlobStore::Disk { root } => root.display().to_string(),
            BlobStore::Memory(_) => "memory".to_string(),
        };
        f.debug_struct("LayerCache")
            .field("location", &location)
            .field("entries", &self.inner.index.read().len())
            .finish_non_exhaustive()
    }
}

const INDEX_FILE: &str = "index.json";

impl LayerCache {
    /// Open (or create) a cache directory and load its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the index is
    /// unreadable.
    pub fn open(dir: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = dir.into();
        std::fs::create_dir_all(blob_dir(&root))?;

        let index_path = root.join(INDEX_FILE);
        let mut index: BTreeMap<CacheKey, CacheEntry> = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| KilnError::Cache {
                message: format!("corrupt index {}: {e}", index_path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let before = index.len();
        index.retain(|_, entry| blob_path(&root, &entry.layer.digest).is_file());
        let pruned = before != index.len();
        if pruned {
            tracing::warn!(
                dropped = before - index.len(),
                "Dropped cache entries with missing blobs"
            );
        }

        tracing::debug!(dir = %root.display(), entries = index.len(), "Opened layer cache");
        Ok(Self::with_store(BlobStore::Disk { root }, index, pruned))
    }

    /// A cache that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(
            BlobStore::Memory(RwLock::new(HashMap::new())),
            BTreeMap::new(),
            false,
        )
    }

    fn with_store(blobs: BlobStore, index: BTreeMap<CacheKey, CacheEntry>, dirty: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                blobs,
                index: RwLock::new(index),
                in_flight: DashMap::new(),
                accessed: DashMap::new(),
                dirty: AtomicBool::new(dirty),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Look up a layer and record the access.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<Layer> {
        let layer = self.inner.index.read().get(key)?.layer.clone();
        self.inner.accessed.insert(key.clone(), Utc::now());
        self.inner.dirty.store(true, Ordering::Relaxed);
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key.digest().short(), layer = %layer.digest.short(), "Cache hit");
        Some(layer)
    }

    /// Move queued access times into the index.
    fn record_accesses(&self) {
        if self.inner.accessed.is_empty() {
            return;
        }
        let pending: Vec<(CacheKey, DateTime<Utc>)> = self
            .inner
            .accessed
            .iter()
            .map(|access| (access.key().clone(), *access.value()))
            .collect();
        let mut index = self.inner.index.write();
        for (key, at) in pending {
            self.inner.accessed.remove_if(&key, |_, queued| *queued == at);
            if let Some(entry) = index.get_mut(&key) {
                entry.last_access = entry.last_access.max(at);
            }
        }
    }

    /// Store a layer archive under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be written.
    pub fn store(
        &self,
        key: &CacheKey,
        artifact: &LayerArtifact,
        created_by: &str,
    ) -> KilnResult<Layer> {
        self.write_blob(artifact)?;

        let layer = Layer {
            digest: artifact.digest.clone(),
            size: artifact.size(),
            created_by: created_by.to_string(),
        };
        let now = Utc::now();
        self.inner.index.write().insert(
            key.clone(),
            CacheEntry {
                layer: layer.clone(),
                created: now,
                last_access: now,
            },
        );
        self.inner.dirty.store(true, Ordering::Relaxed);

        tracing::debug!(
            key = %key.digest().short(),
            layer = %layer.digest.short(),
            size = layer.size,
            "Stored layer"
        );
        Ok(layer)
    }

    fn write_blob(&self, artifact: &LayerArtifact) -> KilnResult<()> {
        match &self.inner.blobs {
            BlobStore::Disk { root } => {
                let path = blob_path(root, &artifact.digest);
                if path.is_file() {
                    return Ok(());
                }
                let dir = blob_dir(root);
                let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                std::io::Write::write_all(&mut tmp, &artifact.bytes)?;
                tmp.persist(&path).map_err(|e| KilnError::Io(e.error))?;
            }
            BlobStore::Memory(blobs) => {
                blobs
                    .write()
                    .entry(artifact.digest.clone())
                    .or_insert_with(|| Arc::new(artifact.bytes.clone()));
            }
        }
        Ok(())
    }

    /// Return the layer for `key`, computing and storing it at most once.
    ///
    /// When `use_cache` is false the lookup is skipped but the result is
    /// still stored. Concurrent callers for the same key wait for a single
    /// computation. If that computation fails or its caller is dropped,
    /// nothing is stored and the next caller computes again.
    ///
    /// # Errors
    ///
    /// Returns the computation's error, or a storage error.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        created_by: &str,
        use_cache: bool,
        compute: F,
    ) -> KilnResult<(Layer, CacheOutcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KilnResult<LayerArtifact>>,
    {
        if use_cache {
            if let Some(layer) = self.lookup(key) {
                return Ok((layer, CacheOutcome::Hit));
            }
        }

        let cell = self
            .inner
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let computed = AtomicBool::new(false);
        let result = cell
            .get_or_try_init(|| {
                let computed = &computed;
                async move {
                    // Stored by a caller whose in-flight cell was already retired.
                    if use_cache {
                        if let Some(layer) = self.lookup(key) {
                            return Ok(layer);
                        }
                    }
                    computed.store(true, Ordering::Relaxed);
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let artifact = compute().await?;
                    let cache = self.clone();
                    let key = key.clone();
                    let created_by = created_by.to_string();
                    tokio::task::spawn_blocking(move || cache.store(&key, &artifact, &created_by))
                        .await
                        .map_err(|e| KilnError::Internal {
                            message: format!("blob write task failed: {e}"),
                        })?
                }
            })
            .await
            .cloned();

        self.inner
            .in_flight
            .remove_if(key, |_, existing| Arc::ptr_eq(existing, &cell));

        let layer = result?;
        let outcome = if computed.load(Ordering::Relaxed) {
            CacheOutcome::Computed
        } else {
            CacheOutcome::Hit
        };
        Ok((layer, outcome))
    }

    /// Read a layer's archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is missing.
    pub fn artifact(&self, layer: &Layer) -> KilnResult<Vec<u8>> {
        match &self.inner.blobs {
            BlobStore::Disk { root } => Ok(std::fs::read(blob_path(root, &layer.digest))?),
            BlobStore::Memory(blobs) => blobs
                .read()
                .get(&layer.digest)
                .map(|bytes| bytes.as_ref().clone())
                .ok_or_else(|| KilnError::Cache {
                    message: format!("missing blob {}", layer.digest),
                }),
        }
    }

    /// Snapshot of the index.
    #[must_use]
    pub fn entries(&self) -> Vec<(CacheKey, CacheEntry)> {
        self.record_accesses();
        self.inner
            .index
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.read();
        let blobs: BTreeMap<&Digest, u64> = index
            .values()
            .map(|entry| (&entry.layer.digest, entry.layer.size))
            .collect();
        CacheStats {
            entries: index.len(),
            total_bytes: blobs.values().sum(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Remove every entry matching `predicate`, then delete blobs no
    /// remaining entry references. Persists the index when disk-backed.
    ///
    /// # Errors
    ///
    /// Returns an error if blobs cannot be deleted or the index written.
    pub fn evict<P>(&self, predicate: P) -> KilnResult<EvictionReport>
    where
        P: Fn(&CacheKey, &CacheEntry) -> bool,
    {
        self.record_accesses();
        let mut report = EvictionReport::default();
        let referenced: BTreeSet<Digest> = {
            let mut index = self.inner.index.write();
            let before = index.len();
            index.retain(|key, entry| !predicate(key, entry));
            report.entries = before - index.len();
            index.values().map(|e| e.layer.digest.clone()).collect()
        };

        match &self.inner.blobs {
            BlobStore::Disk { root } => {
                for entry in std::fs::read_dir(blob_dir(root))? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Ok(digest) = Digest::from_hex(&name) else {
                        continue;
                    };
                    if !referenced.contains(&digest) {
                        report.bytes += entry.metadata()?.len();
                        report.blobs += 1;
                        std::fs::remove_file(entry.path())?;
                    }
                }
            }
            BlobStore::Memory(blobs) => {
                blobs.write().retain(|digest, bytes| {
                    let keep = referenced.contains(digest);
                    if !keep {
                        report.blobs += 1;
                        report.bytes += bytes.len() as u64;
                    }
                    keep
                });
            }
        }

        if report.entries > 0 {
            self.inner.dirty.store(true, Ordering::Relaxed);
        }
        self.flush()?;

        tracing::info!(
            entries = report.entries,
            blobs = report.blobs,
            bytes = report.bytes,
            "Evicted cache entries"
        );
        Ok(report)
    }

    /// Persist the index. No-op for in-memory caches or when unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn flush(&self) -> KilnResult<()> {
        let BlobStore::Disk { root } = &self.inner.blobs else {
            return Ok(());
        };
        if !self.inner.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.record_accesses();

        let json = {
            let index = self.inner.index.read();
            serde_json::to_vec_pretty(&*index)?
        };
        let mut tmp = tempfile::NamedTempFile::new_in(root)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.persist(root.join(INDEX_FILE))
            .map_err(|e| KilnError::Io(e.error))?;
        tracing::debug!(dir = %root.display(), "Flushed cache index");
        Ok(())
    }
}

fn blob_dir(root: &Path) -> PathBuf {
    root.join("blobs").join(Digest::ALGORITHM)
}

fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    blob_dir(root).join(digest.hex())
}

/// Predicate matching entries not accessed within `age`.
pub fn older_than(age: chrono::Duration) -> impl Fn(&CacheKey, &CacheEntry) -> bool {
    let cutoff = Utc::now() - age;
    move |_, entry| entry.last_access < cutoff
}

/// Predicate that keeps the most recently used entries within `max_bytes`
/// and matches the rest.
#[must_use]
pub fn lru_budget(cache: &LayerCache, max_bytes: u64) -> impl Fn(&CacheKey, &CacheEntry) -> bool {
    let mut entries = cache.entries();
    entries.sort_by(|a, b| b.1.last_access.cmp(&a.1.last_access).then(a.0.cmp(&b.0)));

    let mut kept_blobs = BTreeSet::new();
    let mut used = 0u64;
    let mut evict = BTreeSet::new();
    for (key, entry) in entries {
        if kept_blobs.contains(&entry.layer.digest) {
            continue;
        }
        if used + entry.layer.size <= max_bytes {
            used += entry.layer.size;
            kept_blobs.insert(entry.layer.digest);
        } else {
            evict.insert(key);
        }
    }
    move |key, _| evict.contains(key)
}
