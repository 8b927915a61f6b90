// ============================================================================
// Second-Level Cache
// ============================================================================
//
// Cross-context cache of committed entity rows keyed by hierarchy root and
// identifier. Membership checks and evictions are synchronous and visible to
// every context immediately. The cache is never a source of transactional
// consistency: entries are only as fresh as the last commit that wrote them.
//
// ============================================================================

use crate::core::{EntityKey, Identifier, PersistenceError, Result};
use crate::metamodel::{EntityDescriptor, Metamodel};
use crate::store::Record;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Unit-wide policy deciding which entity types are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedCacheMode {
    All,
    None,
    EnableSelective,
    DisableSelective,
    #[default]
    Unspecified,
}

impl SharedCacheMode {
    /// Whether a type with the given (inherited) `Cacheable` declaration is
    /// cached under this mode. `Unspecified` behaves like `EnableSelective`.
    pub fn admits(&self, declared: Option<bool>) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::EnableSelective | Self::Unspecified => declared == Some(true),
            Self::DisableSelective => declared != Some(false),
        }
    }
}

impl FromStr for SharedCacheMode {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(Self::All),
            "NONE" => Ok(Self::None),
            "ENABLE_SELECTIVE" => Ok(Self::EnableSelective),
            "DISABLE_SELECTIVE" => Ok(Self::DisableSelective),
            "UNSPECIFIED" => Ok(Self::Unspecified),
            other => Err(PersistenceError::Configuration(format!(
                "Unknown shared cache mode '{}'",
                other
            ))),
        }
    }
}

/// Whether reads may be served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheRetrieveMode {
    #[default]
    Use,
    Bypass,
}

impl FromStr for CacheRetrieveMode {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USE" => Ok(Self::Use),
            "BYPASS" => Ok(Self::Bypass),
            other => Err(PersistenceError::Configuration(format!(
                "Unknown cache retrieve mode '{}'",
                other
            ))),
        }
    }
}

/// Whether rows read from the store are put into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStoreMode {
    /// Cache rows read from the store and written at commit.
    #[default]
    Use,
    /// Leave the cache alone on reads; commits still invalidate.
    Bypass,
    /// Like `Use`, and `refresh` overwrites the cached entry too.
    Refresh,
}

impl FromStr for CacheStoreMode {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USE" => Ok(Self::Use),
            "BYPASS" => Ok(Self::Bypass),
            "REFRESH" => Ok(Self::Refresh),
            other => Err(PersistenceError::Configuration(format!(
                "Unknown cache store mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Record,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Entries removed by `evict*` calls or flush invalidation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

pub struct SecondLevelCache {
    entries: Mutex<LruCache<EntityKey, CacheEntry>>,
    mode: SharedCacheMode,
    metamodel: Metamodel,
    stats: CacheStats,
}

impl SecondLevelCache {
    /// `capacity` of `None` keeps every entry until evicted.
    pub fn new(metamodel: Metamodel, mode: SharedCacheMode, capacity: Option<NonZeroUsize>) -> Self {
        let entries = match capacity {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            mode,
            metamodel,
            stats: CacheStats::default(),
        }
    }

    pub fn mode(&self) -> SharedCacheMode {
        self.mode
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn is_cacheable(&self, descriptor: &EntityDescriptor) -> bool {
        self.mode.admits(descriptor.declared_cacheable())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, entry: &CacheEntry, entity_type: &str) -> bool {
        self.metamodel.is_subtype(&entry.record.concrete_type, entity_type)
    }

    /// Cached row for `key` when its concrete type is `entity_type` or one
    /// of its subtypes. Counts a hit or a miss.
    pub fn get(&self, entity_type: &str, key: &EntityKey) -> Option<Record> {
        let found = {
            let mut entries = self.entries.lock();
            entries
                .get(key)
                .filter(|entry| self.matches(entry, entity_type))
                .map(|entry| entry.record.clone())
        };
        match &found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Stores `record` when its concrete type is cacheable; returns whether
    /// it was stored.
    pub fn put(&self, record: Record) -> bool {
        let admitted = self
            .metamodel
            .try_entity(&record.concrete_type)
            .map(|d| self.is_cacheable(d))
            .unwrap_or(false);
        if !admitted {
            return false;
        }
        let key = record.key.clone();
        self.entries.lock().put(
            key,
            CacheEntry {
                record,
                cached_at: Utc::now(),
            },
        );
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn key_for(&self, entity_type: &str, id: Identifier) -> Option<EntityKey> {
        self.metamodel.try_entity(entity_type).map(|d| d.key(id))
    }

    /// Membership check without touching recency or statistics.
    pub fn contains(&self, entity_type: &str, id: impl Into<Identifier>) -> bool {
        let Some(key) = self.key_for(entity_type, id.into()) else {
            return false;
        };
        self.entries
            .lock()
            .peek(&key)
            .is_some_and(|entry| self.matches(entry, entity_type))
    }

    pub fn evict(&self, entity_type: &str, id: impl Into<Identifier>) {
        let Some(key) = self.key_for(entity_type, id.into()) else {
            return;
        };
        let mut entries = self.entries.lock();
        let hit = entries
            .peek(&key)
            .is_some_and(|entry| self.matches(entry, entity_type));
        if hit {
            entries.pop(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache entry evicted");
        }
    }

    /// Evicts every entry of `entity_type` and its subtypes.
    pub fn evict_type(&self, entity_type: &str) {
        let mut entries = self.entries.lock();
        let doomed: Vec<EntityKey> = entries
            .iter()
            .filter(|(_, entry)| self.matches(entry, entity_type))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        self.stats
            .evictions
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        debug!(entity_type, evicted = doomed.len(), "cache type evicted");
    }

    pub fn evict_all(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        self.stats
            .evictions
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, "cache cleared");
    }

    /// Drops `key` regardless of type; used to invalidate written rows.
    pub(crate) fn invalidate(&self, key: &EntityKey) {
        if self.entries.lock().pop(key).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Application handle to the second-level cache of a persistence unit.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<SecondLevelCache>,
}

impl Cache {
    pub fn new(inner: Arc<SecondLevelCache>) -> Self {
        Self { inner }
    }

    pub fn contains(&self, entity_type: &str, id: impl Into<Identifier>) -> bool {
        self.inner.contains(entity_type, id)
    }

    pub fn evict(&self, entity_type: &str, id: impl Into<Identifier>) {
        self.inner.evict(entity_type, id)
    }

    pub fn evict_type(&self, entity_type: &str) {
        self.inner.evict_type(entity_type)
    }

    pub fn evict_all(&self) {
        self.inner.evict_all()
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.stats()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("mode", &self.inner.mode)
            .field("entries", &self.inner.len())
            .finish()
    }
}
