//! Two-tier LRU cache of parsed payloads.
//!
//! Open files live in the persistent tier behind strong `Arc`s. Closed files
//! live in the transient tier behind `Weak` handles, so that tier alone never
//! keeps a payload alive. Both tiers are LRU-bounded independently.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::indexer::parser::{ModuleResolver, SourceParser};
use crate::indexer::records::FileRecordStore;
use crate::indexer::source::{content_hash, SourceReader};
use crate::models::{AstPayload, CacheTier, LineIndex};

/// LRU map with a floor and a ceiling on occupancy
pub struct LruTier<V> {
    min: usize,
    max: usize,
    entries: HashMap<PathBuf, CacheEntry<V>>,
    /// Front = most recently used
    order: VecDeque<PathBuf>,
}

/// Cache entry with metadata
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub accessed_at: Instant,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            accessed_at: now,
            access_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.accessed_at = Instant::now();
        self.access_count += 1;
    }
}

#[allow(dead_code)]
impl<V> LruTier<V> {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max: max.max(min),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &Path) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.move_to_front(key);
        self.entries.get_mut(key).map(|entry| {
            entry.touch();
            &entry.value
        })
    }

    /// Read without refreshing recency.
    pub fn peek(&self, key: &Path) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert as most recent and return whatever fell off the LRU end.
    pub fn insert(&mut self, key: PathBuf, value: V) -> Vec<(PathBuf, V)> {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.entries.insert(key.clone(), CacheEntry::new(value));
        self.order.push_front(key);

        let mut evicted = Vec::new();
        while self.entries.len() > self.max {
            match self.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &Path) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry.value)
    }

    /// Evict least recently used entries down to the floor.
    pub fn trim_to_min(&mut self) -> Vec<(PathBuf, V)> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.min {
            match self.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    /// Drop entries failing `keep`, regardless of the floor.
    pub fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(&entry.value));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &PathBuf> {
        self.order.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|e| &e.value)
    }

    fn pop_lru(&mut self) -> Option<(PathBuf, V)> {
        let key = self.order.pop_back()?;
        let entry = self.entries.remove(&key)?;
        Some((key, entry.value))
    }

    fn move_to_front(&mut self, key: &Path) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_front(k);
            }
        }
    }
}

/// Payload cache keyed by path
pub struct AstCache {
    persistent: LruTier<Arc<AstPayload>>,
    transient: LruTier<Weak<AstPayload>>,
    reader: Arc<dyn SourceReader>,
    parser: Box<dyn SourceParser>,
    resolver: ModuleResolver,
    keep_source: bool,
    stats: CacheStats,
}

#[allow(dead_code)]
impl AstCache {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        parser: Box<dyn SourceParser>,
        resolver: ModuleResolver,
        min_cache_size: usize,
        max_cache_size: usize,
    ) -> Self {
        Self {
            persistent: LruTier::new(min_cache_size, max_cache_size),
            transient: LruTier::new(min_cache_size, max_cache_size),
            reader,
            parser,
            resolver,
            keep_source: false,
            stats: CacheStats::default(),
        }
    }

    /// Keep raw source text inside payloads.
    pub fn with_keep_source(mut self, keep_source: bool) -> Self {
        self.keep_source = keep_source;
        self
    }

    pub fn reader(&self) -> &Arc<dyn SourceReader> {
        &self.reader
    }

    /// Payload for `path`, parsing it on a miss. Unknown paths get a record.
    pub fn get(&mut self, records: &mut FileRecordStore, path: &Path) -> Result<Arc<AstPayload>> {
        if let Some(payload) = self.persistent.get(path) {
            self.stats.hits += 1;
            return Ok(payload.clone());
        }
        if let Some(handle) = self.transient.get(path) {
            if let Some(payload) = handle.upgrade() {
                self.stats.hits += 1;
                return Ok(payload);
            }
            self.transient.remove(path);
            self.stats.reclaimed += 1;
        }

        self.stats.misses += 1;
        let payload = Arc::new(self.load(records, path)?);
        let open = records.get_or_create(path).open;
        self.install(path, &payload, open);
        Ok(payload)
    }

    /// Bytes `payload` was parsed from, or `None` once they changed.
    pub fn source_of(&self, records: &FileRecordStore, payload: &AstPayload) -> Option<Vec<u8>> {
        if let Some(source) = &payload.source {
            return Some(source.as_bytes().to_vec());
        }
        let bytes = match records.get(&payload.path).and_then(|r| r.overlay.as_ref()) {
            Some(text) => text.as_bytes().to_vec(),
            None => self.reader.read(&payload.path).ok()?.bytes,
        };
        (content_hash(&bytes) == payload.hash).then_some(bytes)
    }

    /// Cached payload without loading or touching recency.
    pub fn lookup(&self, path: &Path) -> Option<Arc<AstPayload>> {
        self.persistent
            .peek(path)
            .cloned()
            .or_else(|| self.transient.peek(path).and_then(Weak::upgrade))
    }

    pub fn tier_of(&self, path: &Path) -> Option<CacheTier> {
        if self.persistent.contains(path) {
            Some(CacheTier::Persistent)
        } else if self
            .transient
            .peek(path)
            .is_some_and(|handle| handle.strong_count() > 0)
        {
            Some(CacheTier::Transient)
        } else {
            None
        }
    }

    /// Detach the cache's own reference. Holders elsewhere keep the payload
    /// alive until they drop it.
    pub fn evict(&mut self, path: &Path) -> bool {
        let strong = self.persistent.remove(path).is_some();
        let weak = self.transient.remove(path).is_some();
        if strong || weak {
            self.stats.evictions += 1;
            tracing::trace!("Evicted payload for {:?}", path);
        }
        strong || weak
    }

    /// Content changed: whatever is cached is wrong now.
    pub fn invalidate(&mut self, path: &Path) {
        if self.persistent.remove(path).is_some() | self.transient.remove(path).is_some() {
            self.stats.invalidations += 1;
        }
    }

    /// File opened: upgrade a live transient handle to a strong entry.
    pub fn promote(&mut self, path: &Path) {
        let Some(handle) = self.transient.remove(path) else {
            return;
        };
        if let Some(payload) = handle.upgrade() {
            let evicted = self.persistent.insert(path.to_path_buf(), payload);
            self.note_evicted(evicted.len());
            tracing::debug!("Promoted {:?} to persistent tier", path);
        }
    }

    /// File closed: downgrade to a weak handle, reclaimable once unreferenced.
    pub fn demote(&mut self, path: &Path) {
        let Some(payload) = self.persistent.remove(path) else {
            return;
        };
        let evicted = self
            .transient
            .insert(path.to_path_buf(), Arc::downgrade(&payload));
        self.note_evicted(evicted.len());
        tracing::debug!("Demoted {:?} to transient tier", path);
    }

    /// Memory pressure: trim the transient tier to its floor and drop dead handles.
    pub fn reclaim_transient(&mut self) -> usize {
        let trimmed = self.transient.trim_to_min().len();
        self.note_evicted(trimmed);
        trimmed + self.sweep()
    }

    /// Forget transient handles whose payload is already gone.
    pub fn sweep(&mut self) -> usize {
        let swept = self.transient.retain(|handle| handle.strong_count() > 0);
        self.stats.reclaimed += swept as u64;
        swept
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.persistent_entries = self.persistent.len();
        stats.transient_entries = self.transient.len();
        stats.live_transient = self
            .transient
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count();
        stats.calculate_hit_rate();
        stats
    }

    fn load(&mut self, records: &mut FileRecordStore, path: &Path) -> Result<AstPayload> {
        let record = records.get_or_create(path);
        let (bytes, hash, mtime) = match &record.overlay {
            Some(text) => {
                let bytes = text.as_bytes().to_vec();
                let hash = content_hash(&bytes);
                (bytes, hash, record.mtime)
            }
            None => {
                let file = self
                    .reader
                    .read(path)
                    .map_err(|e| IndexError::read(path, e))?;
                (file.bytes, file.hash, file.mtime)
            }
        };

        let previous = record.hash.replace(hash.clone());
        record.mtime = mtime;
        record.missing = false;
        if previous.is_some_and(|h| h != hash) {
            records.mark_stale(path);
        }

        let parsed = self.parser.parse(path, &bytes);
        let mut outline = parsed.outline;
        let imports = self
            .resolver
            .resolve_bindings(self.reader.as_ref(), path, &mut outline);
        self.stats.parses += 1;
        tracing::debug!(
            "Parsed {:?}: {} symbols, {} imports",
            path,
            outline.symbol_count(),
            imports.len()
        );

        let source: Option<Arc<str>> = self
            .keep_source
            .then(|| Arc::from(String::from_utf8_lossy(&bytes).as_ref()));

        Ok(AstPayload {
            path: path.to_path_buf(),
            hash,
            mtime,
            tree: parsed.tree,
            source,
            line_index: LineIndex::new(&bytes),
            outline: Arc::new(outline),
            imports,
            diagnostics: parsed.diagnostics,
        })
    }

    fn install(&mut self, path: &Path, payload: &Arc<AstPayload>, open: bool) {
        let evicted = if open {
            self.transient.remove(path);
            self.persistent
                .insert(path.to_path_buf(), payload.clone())
                .into_iter()
                .map(|(key, _)| key)
                .collect::<Vec<_>>()
        } else {
            self.persistent.remove(path);
            self.transient
                .insert(path.to_path_buf(), Arc::downgrade(payload))
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };
        for key in &evicted {
            tracing::trace!("LRU evicted {:?}", key);
        }
        self.note_evicted(evicted.len());
    }

    fn note_evicted(&mut self, count: usize) {
        self.stats.evictions += count as u64;
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f32,
    pub parses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Transient handles found dead
    pub reclaimed: u64,
    pub persistent_entries: usize,
    pub transient_entries: usize,
    pub live_transient: usize,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        };
    }
}
