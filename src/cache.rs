//! Content-addressed native code cache.
//!
//! Maps the SHA-256 of a module's bytecode to the serialized native artifact
//! produced for it. On disk every entry is two files:
//!
//! ```text
//! <cache_dir>/<hex>.cwasm   serialized native module
//! <cache_dir>/<hex>.json    { hash, size, artifact_sha256, created_at_unix_ms, origin, backend }
//! ```
//!
//! The metadata file is written last and acts as the commit marker; an entry
//! without it (or whose sizes disagree) is discarded when the directory is
//! indexed. Both files are written to a temporary name and renamed.
//!
//! Artifact bytes are read lazily and checked against `artifact_sha256`
//! before they are handed out; a mismatch drops the entry and counts as a
//! miss.
//!
//! The in-memory index is an LRU (`lru::LruCache`) guarded by a single mutex.
//! The cache is consulted at registration and at compile completion only,
//! never per call. Entries referenced by a registered module (refcount > 0)
//! are never evicted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::descriptor::ContentHash;
use crate::error::CacheError;
use crate::stats::now_millis;

const ARTIFACT_EXT: &str = "cwasm";
const META_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

/// A cached native artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub hash: ContentHash,
    pub bytes: Arc<[u8]>,
    pub created_at_unix_ms: u64,
    /// `name@version` of the module whose compile produced it.
    pub origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    hash: ContentHash,
    size: u64,
    /// Digest of the artifact file itself (`hash` is of the source bytecode).
    artifact_sha256: ContentHash,
    created_at_unix_ms: u64,
    origin: String,
    backend: String,
}

struct Entry {
    meta: ArtifactMeta,
    refcount: usize,
    /// Always present for in-memory caches; loaded lazily from disk otherwise.
    bytes: Option<Arc<[u8]>>,
}

struct Inner {
    entries: LruCache<ContentHash, Entry>,
    total_bytes: u64,
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub dir: Option<PathBuf>,
    pub entries: usize,
    pub referenced: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

/// Native code cache keyed by bytecode content hash.
pub struct NativeCodeCache {
    dir: Option<PathBuf>,
    budget_bytes: u64,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl NativeCodeCache {
    /// Cache that lives only as long as the process.
    pub fn in_memory(budget_bytes: u64) -> Self {
        Self::with_dir(None, budget_bytes)
    }

    /// Open (or create) a persistent cache directory and index its entries.
    pub fn open(dir: impl Into<PathBuf>, budget_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        let cache = Self::with_dir(Some(dir.clone()), budget_bytes);

        let mut metas = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| CacheError::io(&dir, e))? {
            let path = entry.map_err(|e| CacheError::io(&dir, e))?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXT) => match read_meta(&path) {
                    Ok(meta) if artifact_matches(&dir, &meta) => metas.push(meta),
                    Ok(meta) => {
                        warn!(target: "quidditch_udf::cache", hash = %meta.hash.short(), "Discarding cache entry with missing or truncated artifact");
                        remove_files(&dir, &meta.hash);
                    }
                    Err(e) => {
                        warn!(target: "quidditch_udf::cache", error = %e, "Discarding unreadable cache metadata");
                        let _ = fs::remove_file(&path);
                    }
                },
                Some(TMP_EXT) => {
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }

        // Oldest first so the newest entries end up most recently used.
        metas.sort_by_key(|m| m.created_at_unix_ms);
        {
            let mut inner = cache.inner.lock();
            for meta in metas {
                inner.total_bytes += meta.size;
                inner.entries.put(
                    meta.hash,
                    Entry {
                        meta,
                        refcount: 0,
                        bytes: None,
                    },
                );
            }
            let freed = cache.evict_locked(&mut inner, budget_bytes);
            info!(
                target: "quidditch_udf::cache",
                dir = %dir.display(),
                entries = inner.entries.len(),
                bytes = inner.total_bytes,
                freed,
                "Opened native code cache"
            );
        }
        Ok(cache)
    }

    fn with_dir(dir: Option<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            dir,
            budget_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.inner.lock().entries.contains(hash)
    }

    /// Fetch the artifact for `hash`, marking it most recently used.
    pub fn lookup(&self, hash: &ContentHash) -> Option<Artifact> {
        let mut inner = self.inner.lock();
        let found = match inner.entries.get_mut(hash) {
            None => None,
            Some(entry) => match &entry.bytes {
                Some(bytes) => Some(Ok(artifact_of(&entry.meta, Arc::clone(bytes)))),
                None => Some(self.read_artifact(&entry.meta)),
            },
        };
        match found {
            Some(Ok(artifact)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(artifact)
            }
            Some(Err(e)) => {
                warn!(target: "quidditch_udf::cache", hash = %hash.short(), error = %e, "Cached artifact unreadable, dropping entry");
                self.remove_locked(&mut inner, hash);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an artifact. Idempotent: returns `Ok(false)` if `hash` is already present.
    pub fn store(&self, hash: ContentHash, bytes: &[u8], origin: &str, backend: &str) -> Result<bool, CacheError> {
        self.insert(hash, bytes, origin, backend, false)
    }

    /// Store (if absent) and take a reference in one step, so the entry cannot
    /// be evicted between the two.
    pub fn store_and_acquire(
        &self,
        hash: ContentHash,
        bytes: &[u8],
        origin: &str,
        backend: &str,
    ) -> Result<bool, CacheError> {
        self.insert(hash, bytes, origin, backend, true)
    }

    fn insert(
        &self,
        hash: ContentHash,
        bytes: &[u8],
        origin: &str,
        backend: &str,
        acquire: bool,
    ) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&hash) {
            if acquire {
                entry.refcount += 1;
            }
            return Ok(false);
        }

        let meta = ArtifactMeta {
            hash,
            size: bytes.len() as u64,
            artifact_sha256: ContentHash::of(bytes),
            created_at_unix_ms: now_millis(),
            origin: origin.to_owned(),
            backend: backend.to_owned(),
        };
        let cached_bytes = match &self.dir {
            Some(dir) => {
                write_entry(dir, &meta, bytes)?;
                None
            }
            None => Some(Arc::from(bytes)),
        };
        inner.total_bytes += meta.size;
        inner.entries.put(
            hash,
            Entry {
                meta,
                refcount: usize::from(acquire),
                bytes: cached_bytes,
            },
        );
        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(target: "quidditch_udf::cache", hash = %hash.short(), size = bytes.len(), origin, "Stored native artifact");

        let budget = self.budget_bytes;
        self.evict_locked(&mut inner, budget);
        Ok(true)
    }

    /// Take a reference on an entry. Returns false if it is not cached.
    pub fn acquire(&self, hash: &ContentHash) -> bool {
        match self.inner.lock().entries.peek_mut(hash) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference. Entries whose count reaches zero become evictable;
    /// their bytes stay cached.
    pub fn release(&self, hash: &ContentHash) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.peek_mut(hash) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        if inner.total_bytes > self.budget_bytes {
            let budget = self.budget_bytes;
            self.evict_locked(&mut inner, budget);
        }
    }

    pub fn refcount(&self, hash: &ContentHash) -> usize {
        self.inner
            .lock()
            .entries
            .peek(hash)
            .map_or(0, |e| e.refcount)
    }

    /// Drop an entry that turned out to be unusable (e.g. built by an
    /// incompatible engine). Referenced entries are left alone.
    pub fn invalidate(&self, hash: &ContentHash) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.peek(hash) {
            Some(entry) if entry.refcount == 0 => {
                self.remove_locked(&mut inner, hash);
                true
            }
            _ => false,
        }
    }

    /// Evict unreferenced entries, least recently used first, until the cache
    /// holds at most `target_bytes`. Returns the number of bytes freed.
    pub fn evict(&self, target_bytes: u64) -> u64 {
        let mut inner = self.inner.lock();
        self.evict_locked(&mut inner, target_bytes)
    }

    fn evict_locked(&self, inner: &mut Inner, target_bytes: u64) -> u64 {
        if inner.total_bytes <= target_bytes {
            return 0;
        }
        let candidates: Vec<ContentHash> = inner
            .entries
            .iter()
            .rev()
            .filter(|(_, e)| e.refcount == 0)
            .map(|(h, _)| *h)
            .collect();

        let mut freed = 0;
        for hash in candidates {
            if inner.total_bytes <= target_bytes {
                break;
            }
            freed += self.remove_locked(inner, &hash);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(target: "quidditch_udf::cache", hash = %hash.short(), "Evicted native artifact");
        }
        freed
    }

    fn remove_locked(&self, inner: &mut Inner, hash: &ContentHash) -> u64 {
        let Some(entry) = inner.entries.pop(hash) else {
            return 0;
        };
        inner.total_bytes = inner.total_bytes.saturating_sub(entry.meta.size);
        if let Some(dir) = &self.dir {
            remove_files(dir, hash);
        }
        entry.meta.size
    }

    fn read_artifact(&self, meta: &ArtifactMeta) -> Result<Artifact, CacheError> {
        let Some(dir) = &self.dir else {
            return Err(CacheError::io(
                PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "artifact bytes missing"),
            ));
        };
        let path = artifact_path(dir, &meta.hash);
        let bytes = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
        if bytes.len() as u64 != meta.size {
            return Err(CacheError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "artifact size mismatch"),
            ));
        }
        if ContentHash::of(&bytes) != meta.artifact_sha256 {
            return Err(CacheError::Corrupt { path });
        }
        Ok(artifact_of(meta, Arc::from(bytes)))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            dir: self.dir.clone(),
            entries: inner.entries.len(),
            referenced: inner.entries.iter().filter(|(_, e)| e.refcount > 0).count(),
            total_bytes: inner.total_bytes,
            budget_bytes: self.budget_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn artifact_of(meta: &ArtifactMeta, bytes: Arc<[u8]>) -> Artifact {
    Artifact {
        hash: meta.hash,
        bytes,
        created_at_unix_ms: meta.created_at_unix_ms,
        origin: meta.origin.clone(),
    }
}

fn artifact_path(dir: &Path, hash: &ContentHash) -> PathBuf {
    dir.join(format!("{}.{ARTIFACT_EXT}", hash.to_hex()))
}

fn meta_path(dir: &Path, hash: &ContentHash) -> PathBuf {
    dir.join(format!("{}.{META_EXT}", hash.to_hex()))
}

fn read_meta(path: &Path) -> Result<ArtifactMeta, CacheError> {
    let content = fs::read(path).map_err(|e| CacheError::io(path, e))?;
    serde_json::from_slice(&content).map_err(|source| CacheError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

fn artifact_matches(dir: &Path, meta: &ArtifactMeta) -> bool {
    fs::metadata(artifact_path(dir, &meta.hash)).is_ok_and(|m| m.len() == meta.size)
}

/// Write to `<path>.tmp` then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension(TMP_EXT);
    let mut file = fs::File::create(&tmp).map_err(|e| CacheError::io(&tmp, e))?;
    file.write_all(data).map_err(|e| CacheError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CacheError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CacheError::io(path, e))
}

fn write_entry(dir: &Path, meta: &ArtifactMeta, bytes: &[u8]) -> Result<(), CacheError> {
    write_atomic(&artifact_path(dir, &meta.hash), bytes)?;
    let path = meta_path(dir, &meta.hash);
    let json = serde_json::to_vec_pretty(meta).map_err(|source| CacheError::Metadata {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &json)
}

fn remove_files(dir: &Path, hash: &ContentHash) {
    let _ = fs::remove_file(meta_path(dir, hash));
    let _ = fs::remove_file(artifact_path(dir, hash));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ContentHash {
        ContentHash::of(&[n])
    }

    #[test]
    fn test_store_is_idempotent() {
        let cache = NativeCodeCache::in_memory(1024);
        assert!(cache.store(hash(1), b"first", "a@1", "test").unwrap());
        assert!(!cache.store(hash(1), b"second", "b@1", "test").unwrap());
        let artifact = cache.lookup(&hash(1)).unwrap();
        assert_eq!(&*artifact.bytes, b"first");
        assert_eq!(artifact.origin, "a@1");
        assert_eq!(cache.stats().stores, 1);
        assert!(cache.lookup(&hash(2)).is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction_skips_referenced() {
        let cache = NativeCodeCache::in_memory(30);
        cache.store(hash(1), &[0; 10], "a@1", "t").unwrap();
        cache.store(hash(2), &[0; 10], "b@1", "t").unwrap();
        cache.store(hash(3), &[0; 10], "c@1", "t").unwrap();
        assert!(cache.acquire(&hash(1)));
        // Touch 2 so 3 becomes the least recently used unreferenced entry.
        assert!(cache.lookup(&hash(2)).is_some());

        cache.store(hash(4), &[0; 10], "d@1", "t").unwrap();
        assert!(cache.contains(&hash(1)));
        assert!(cache.contains(&hash(2)));
        assert!(!cache.contains(&hash(3)));
        assert!(cache.contains(&hash(4)));
        assert_eq!(cache.stats().total_bytes, 30);
    }

    #[test]
    fn test_explicit_evict() {
        let cache = NativeCodeCache::in_memory(1000);
        for n in 0..5 {
            cache.store(hash(n), &[0; 100], "m@1", "t").unwrap();
        }
        assert!(cache.acquire(&hash(0)));
        assert_eq!(cache.evict(0), 400);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.refcount(&hash(0)), 1);
        cache.release(&hash(0));
        assert_eq!(cache.refcount(&hash(0)), 0);
        assert_eq!(cache.evict(0), 100);
        assert_eq!(cache.stats().evictions, 5);
    }

    #[test]
    fn test_store_and_acquire_survives_tight_budget() {
        let cache = NativeCodeCache::in_memory(5);
        assert!(cache.store_and_acquire(hash(9), &[1; 10], "big@1", "t").unwrap());
        assert!(cache.contains(&hash(9)));
        assert_eq!(cache.refcount(&hash(9)), 1);
        cache.release(&hash(9));
        assert!(!cache.contains(&hash(9)));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
            cache.store(hash(1), b"native-code", "scorer@1.0.0", "t").unwrap();
        }
        assert!(dir.path().join(format!("{}.cwasm", hash(1).to_hex())).exists());

        let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(cache.stats().entries, 1);
        let artifact = cache.lookup(&hash(1)).unwrap();
        assert_eq!(&*artifact.bytes, b"native-code");
        assert_eq!(artifact.origin, "scorer@1.0.0");
    }

    #[test]
    fn test_same_size_corruption_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
            cache.store(hash(1), b"0123456789", "a@1", "t").unwrap();
        }
        let path = dir.path().join(format!("{}.cwasm", hash(1).to_hex()));
        fs::write(&path, b"9876543210").unwrap();

        let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
        assert!(cache.contains(&hash(1)));
        assert!(cache.lookup(&hash(1)).is_none());
        assert!(!cache.contains(&hash(1)));
        assert!(!path.exists());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[test]
    fn test_truncated_entries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
            cache.store(hash(1), b"0123456789", "a@1", "t").unwrap();
            cache.store(hash(2), b"abcdef", "b@1", "t").unwrap();
        }
        fs::write(dir.path().join(format!("{}.cwasm", hash(1).to_hex())), b"0123").unwrap();
        fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        fs::write(dir.path().join("leftover.tmp"), b"x").unwrap();

        let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
        assert!(!cache.contains(&hash(1)));
        assert!(cache.contains(&hash(2)));
        assert!(!dir.path().join("garbage.json").exists());
        assert!(!dir.path().join("leftover.tmp").exists());
    }

    #[test]
    fn test_eviction_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
        cache.store(hash(1), &[7; 64], "a@1", "t").unwrap();
        assert_eq!(cache.evict(0), 64);
        assert!(!dir.path().join(format!("{}.cwasm", hash(1).to_hex())).exists());
        assert!(!dir.path().join(format!("{}.json", hash(1).to_hex())).exists());
    }
}
