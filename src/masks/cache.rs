//! Content-addressed cache of baked masks.
//!
//! Entries are keyed by the canonical mask key. A hit returns the stored
//! payload untouched; a miss runs the bake function once and stores the
//! result. Payloads can be flushed to disk to bound peak memory during large
//! batch bakes and are re-imported lazily on the next request.
//!
//! Callers must invalidate proactively whenever source data changes; nothing
//! here detects stale inputs on its own.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::bake::{BakeInputs, BakeRegistry};
use super::invalidation::InvalidationIndex;
use super::key::{InvalidationTag, MaskKey};
use super::storage::MaskStorage;
use super::MaskTexture;
use crate::error::{Result, StreamingError};

/// Cache statistics for monitoring
#[derive(Clone, Copy, Debug, Default)]
pub struct MaskCacheStats {
    /// Number of cache hits (memory or disk)
    pub hits: usize,
    /// Number of cache misses
    pub misses: usize,
    /// Number of bake function invocations that produced a mask
    pub bakes: usize,
    /// Misses that could not bake because source data was missing
    pub missing: usize,
    /// Entries removed by invalidation
    pub invalidated: usize,
    pub disk_loads: usize,
    pub disk_saves: usize,
    /// Entries currently holding their payload in memory
    pub resident_count: usize,
    /// Bytes held by resident payloads
    pub memory_bytes: usize,
}

impl MaskCacheStats {
    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }

    /// Format as human-readable string
    pub fn summary(&self) -> String {
        format!(
            "Hits: {} | Misses: {} | Rate: {:.1}% | Bakes: {} | Invalidated: {} | Resident: {} | Mem: {:.1}MB",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.bakes,
            self.invalidated,
            self.resident_count,
            self.memory_bytes as f32 / (1024.0 * 1024.0)
        )
    }
}

/// Read-only view of a cached mask.
///
/// The handle keeps its payload alive, but it stops reflecting the cache as
/// soon as the entry is invalidated or cleared; check
/// [`MaskBakeCache::is_current`] before reusing a handle across frames.
#[derive(Clone, Debug)]
pub struct MaskHandle {
    texture: Arc<MaskTexture>,
    canonical: String,
    generation: u64,
}

impl MaskHandle {
    pub fn canonical_key(&self) -> &str {
        &self.canonical
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ptr_eq(&self, other: &MaskHandle) -> bool {
        Arc::ptr_eq(&self.texture, &other.texture)
    }
}

impl Deref for MaskHandle {
    type Target = MaskTexture;

    fn deref(&self) -> &MaskTexture {
        &self.texture
    }
}

enum Payload {
    Resident(Arc<MaskTexture>),
    OnDisk(PathBuf),
}

struct MaskCacheEntry {
    payload: Payload,
    /// Where the payload was last written, if ever
    path: Option<PathBuf>,
    generation: u64,
}

pub struct MaskBakeCache {
    entries: HashMap<String, MaskCacheEntry>,
    index: InvalidationIndex,
    storage: Option<MaskStorage>,
    stats: MaskCacheStats,
    next_generation: u64,
}

impl MaskBakeCache {
    /// Create a memory-only cache
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            index: InvalidationIndex::new(),
            storage: None,
            stats: MaskCacheStats::default(),
            next_generation: 0,
        }
    }

    /// Create a cache backed by a mask directory.
    pub fn with_storage<P: AsRef<Path>>(dir: P) -> Self {
        let mut cache = Self::new();
        cache.storage = Some(MaskStorage::new(dir));
        cache
    }

    pub fn storage(&self) -> Option<&MaskStorage> {
        self.storage.as_ref()
    }

    pub fn stats(&self) -> &MaskCacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &MaskKey) -> bool {
        self.entries.contains_key(&key.canonical())
    }

    /// True if the entry is in memory rather than flushed to disk.
    pub fn is_resident(&self, key: &MaskKey) -> bool {
        matches!(
            self.entries.get(&key.canonical()).map(|e| &e.payload),
            Some(Payload::Resident(_))
        )
    }

    /// Whether `handle` still reflects the cached entry for its key.
    pub fn is_current(&self, handle: &MaskHandle) -> bool {
        self.entries
            .get(&handle.canonical)
            .map(|e| e.generation == handle.generation)
            .unwrap_or(false)
    }

    /// Resident payload for `key`, without baking or touching disk.
    pub fn peek(&self, key: &MaskKey) -> Option<MaskHandle> {
        let canonical = key.canonical();
        let entry = self.entries.get(&canonical)?;
        match &entry.payload {
            Payload::Resident(texture) => Some(MaskHandle {
                texture: Arc::clone(texture),
                canonical,
                generation: entry.generation,
            }),
            Payload::OnDisk(_) => None,
        }
    }

    /// Return the cached mask for `key`, baking it on a miss.
    ///
    /// Returns `None` if the bake reports missing source data (or fails);
    /// callers treat that as "no mask effect".
    pub fn get_or_bake<F>(&mut self, key: &MaskKey, bake: F) -> Option<MaskHandle>
    where
        F: FnOnce(&MaskKey) -> Result<MaskTexture>,
    {
        let canonical = key.canonical();

        if let Some(handle) = self.lookup(&canonical) {
            self.stats.hits += 1;
            return Some(handle);
        }

        // Written by an earlier session or before a clear
        if let Some(handle) = self.import_from_disk(key, &canonical) {
            self.stats.hits += 1;
            return Some(handle);
        }

        self.stats.misses += 1;
        match bake(key) {
            Ok(texture) => {
                self.stats.bakes += 1;
                debug!("Baked mask {} ({}x{})", canonical, texture.width, texture.height);
                Some(self.insert(key, canonical, Arc::new(texture), None))
            }
            Err(StreamingError::MissingDependency(what)) => {
                self.stats.missing += 1;
                warn!("Mask {} not baked, missing dependency: {}", canonical, what);
                None
            }
            Err(e) => {
                warn!("Mask {} failed to bake: {}", canonical, e);
                None
            }
        }
    }

    /// [`MaskBakeCache::get_or_bake`] using the registered baker for the key's kind.
    pub fn get_or_bake_with(
        &mut self,
        key: &MaskKey,
        bakers: &BakeRegistry,
        inputs: &BakeInputs<'_>,
    ) -> Option<MaskHandle> {
        self.get_or_bake(key, |k| bakers.bake(k, inputs))
    }

    /// Remove every entry matching `tag`, in memory and on disk. Returns the
    /// number of in-memory entries removed.
    pub fn invalidate(&mut self, tag: &InvalidationTag) -> usize {
        let matching = self.index.matching(tag);
        for canonical in &matching {
            self.index.remove(canonical);
            if let Some(entry) = self.entries.remove(canonical) {
                self.release(&entry);
                if let Some(path) = &entry.path {
                    if let Err(e) = std::fs::remove_file(path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Could not delete invalidated mask {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }

        let mut purged = 0;
        if let Some(storage) = &self.storage {
            match storage.list_masks() {
                Ok(keys) => {
                    for key in keys.iter().filter(|k| tag.matches(k)) {
                        if storage.delete_mask(key).is_ok() {
                            purged += 1;
                        }
                    }
                }
                Err(e) => warn!("Could not scan mask directory for invalidation: {}", e),
            }
        }

        self.stats.invalidated += matching.len();
        if !matching.is_empty() || purged > 0 {
            info!(
                "Invalidated {} mask(s) for {:?} ({} file(s) removed)",
                matching.len(),
                tag,
                purged
            );
        }
        matching.len()
    }

    /// Write every resident payload to its canonical path and drop it from
    /// memory. Entries reload lazily on their next request.
    pub fn flush_to_disk(&mut self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            warn!("Mask flush requested without a mask directory; payloads stay in memory");
            return Ok(0);
        };

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.payload, Payload::Resident(_)))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();

        let mut written = 0;
        for canonical in keys {
            let Some(key) = MaskKey::parse(&canonical) else {
                continue;
            };
            let Some(entry) = self.entries.get_mut(&canonical) else {
                continue;
            };
            let Payload::Resident(texture) = &entry.payload else {
                continue;
            };
            let bytes = texture.memory_size();
            let path = storage.save_mask(&key, texture)?;
            entry.payload = Payload::OnDisk(path.clone());
            entry.path = Some(path);
            self.stats.resident_count -= 1;
            self.stats.memory_bytes -= bytes;
            self.stats.disk_saves += 1;
            written += 1;
        }

        info!("Flushed {} mask(s) to {}", written, storage.base_dir().display());
        Ok(written)
    }

    /// Drop every entry. Files already on disk are kept.
    pub fn clear_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.index.clear();
        self.stats.resident_count = 0;
        self.stats.memory_bytes = 0;
        debug!("Cleared {} mask(s)", count);
    }

    fn lookup(&mut self, canonical: &str) -> Option<MaskHandle> {
        let entry = self.entries.get_mut(canonical)?;
        let on_disk = match &entry.payload {
            Payload::Resident(texture) => {
                return Some(MaskHandle {
                    texture: Arc::clone(texture),
                    canonical: canonical.to_string(),
                    generation: entry.generation,
                });
            }
            Payload::OnDisk(path) => path.clone(),
        };

        match MaskStorage::load_path(&on_disk) {
            Ok(texture) => {
                let texture = Arc::new(texture);
                self.stats.disk_loads += 1;
                self.stats.resident_count += 1;
                self.stats.memory_bytes += texture.memory_size();
                entry.payload = Payload::Resident(Arc::clone(&texture));
                Some(MaskHandle {
                    texture,
                    canonical: canonical.to_string(),
                    generation: entry.generation,
                })
            }
            Err(e) => {
                warn!("Flushed mask {} could not be reloaded: {}", on_disk.display(), e);
                self.entries.remove(canonical);
                self.index.remove(canonical);
                None
            }
        }
    }

    fn import_from_disk(&mut self, key: &MaskKey, canonical: &str) -> Option<MaskHandle> {
        let storage = self.storage.as_ref()?;
        let path = storage.mask_path(key);
        match storage.load_mask(key) {
            Ok(Some(texture)) => {
                self.stats.disk_loads += 1;
                Some(self.insert(key, canonical.to_string(), Arc::new(texture), Some(path)))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Stored mask {} unreadable, rebaking: {}", path.display(), e);
                None
            }
        }
    }

    fn insert(&mut self, key: &MaskKey, canonical: String, texture: Arc<MaskTexture>, path: Option<PathBuf>) -> MaskHandle {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.stats.resident_count += 1;
        self.stats.memory_bytes += texture.memory_size();
        self.index.insert(key);
        self.entries.insert(
            canonical.clone(),
            MaskCacheEntry {
                payload: Payload::Resident(Arc::clone(&texture)),
                path,
                generation,
            },
        );
        MaskHandle {
            texture,
            canonical,
            generation,
        }
    }

    fn release(&mut self, entry: &MaskCacheEntry) {
        if let Payload::Resident(texture) = &entry.payload {
            self.stats.resident_count -= 1;
            self.stats.memory_bytes -= texture.memory_size();
        }
    }
}

impl Default for MaskBakeCache {
    fn default() -> Self {
        Self::new()
    }
}
