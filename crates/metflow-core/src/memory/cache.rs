//! LRU Memory Manager
//!
//! Reference-counted item store with a kilobyte budget. Items whose reference
//! count drops to zero are moved to a released pool ordered by release time;
//! the oldest released items are evicted when a new item needs room.
//!
//! Thread-safe via interior mutability using parking_lot::Mutex.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::{MemoryError, MemoryManager, MemoryStatus};
use crate::data_item::DataItem;
use crate::request::Request;

/// Default memory budget (10 GiB)
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 10 * 1024 * 1024;

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// Number of contains_data() calls that found the item
    pub hits: u64,
    /// Number of contains_data() calls that did not
    pub misses: u64,
    /// Number of released items evicted
    pub evictions: u64,
    /// Total kilobytes evicted
    pub kb_evicted: u64,
}

impl CacheMetrics {
    /// Get hit rate as a fraction (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn record_eviction(&mut self, kb: u64) {
        self.evictions += 1;
        self.kb_evicted += kb;
    }
}

/// Inner state for LruMemoryManager (protected by Mutex)
///
/// `active`, `reference_counts` and `released` must always be updated
/// together: a key is either active (with a count > 0) or released (with a
/// count of 0), never both.
struct CacheState {
    /// Items with at least one reference
    active: HashMap<String, Arc<DataItem>>,

    /// Reference count for every cached key
    reference_counts: HashMap<String, usize>,

    /// Unreferenced items, least recently released at the "back"
    released: LruCache<String, Arc<DataItem>>,

    /// Resident size of active and released items
    usage_kb: u64,

    metrics: CacheMetrics,
}

impl CacheState {
    /// Increment the reference count of a cached key, reactivating it if it
    /// was released. Returns false if the key is not cached.
    fn block(&mut self, key: &str) -> bool {
        if self.active.contains_key(key) {
            let count = self.reference_counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            trace!("Blocking active item {}; reference counter set to {}", key, count);
            return true;
        }

        if let Some(item) = self.released.pop(key) {
            self.active.insert(key.to_string(), item);
            self.reference_counts.insert(key.to_string(), 1);
            trace!("Reactivating released item {}; reference counter set to 1", key);
            return true;
        }

        false
    }

    /// Evict the least recently released item. Returns the freed size.
    fn evict_oldest(&mut self) -> Option<u64> {
        let (key, item) = self.released.pop_lru()?;
        self.reference_counts.remove(&key);
        let kb = item.memory_size_kb();
        self.usage_kb = self.usage_kb.saturating_sub(kb);
        self.metrics.record_eviction(kb);
        debug!("Evicting released item {} ({} kb)", key, kb);
        Some(kb)
    }
}

/// Memory manager with least-recently-released eviction
///
/// Tracks resident items and their size, evicting released items oldest
/// first when a store would exceed the budget. Items that are still
/// referenced are never evicted, so the budget can be exceeded temporarily.
///
/// Thread-safe: All methods take `&self` and use interior mutability
/// via parking_lot::Mutex for concurrent access.
pub struct LruMemoryManager {
    /// Name shown in logs and status reports
    identifier: String,

    /// Memory budget in kilobytes (immutable after construction)
    limit_kb: u64,

    /// Mutable state protected by Mutex
    state: Mutex<CacheState>,
}

impl LruMemoryManager {
    /// Create a new manager with the given budget
    pub fn new(identifier: impl Into<String>, limit_kb: u64) -> Self {
        Self {
            identifier: identifier.into(),
            limit_kb,
            state: Mutex::new(CacheState {
                active: HashMap::new(),
                reference_counts: HashMap::new(),
                released: LruCache::unbounded(),
                usage_kb: 0,
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Create a manager with the default budget (10 GiB)
    pub fn with_default_limit(identifier: impl Into<String>) -> Self {
        Self::new(identifier, DEFAULT_MEMORY_LIMIT_KB)
    }

    /// Get the budget in kilobytes
    pub fn limit_kb(&self) -> u64 {
        self.limit_kb
    }

    /// Get current resident size in kilobytes
    pub fn usage_kb(&self) -> u64 {
        self.state.lock().usage_kb
    }

    /// Get memory usage as a fraction of the budget
    pub fn memory_usage_ratio(&self) -> f64 {
        if self.limit_kb == 0 {
            0.0
        } else {
            self.usage_kb() as f64 / self.limit_kb as f64
        }
    }

    /// Current reference count of a cached request, if cached
    pub fn reference_count(&self, owner: &str, request: &Request) -> Option<usize> {
        let key = cache_key(owner, request);
        self.state.lock().reference_counts.get(&key).copied()
    }

    /// Get a snapshot of cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().metrics.clone()
    }
}

/// Cache key scoped to the storing object.
fn cache_key(owner: &str, request: &Request) -> String {
    format!("{}/{}", owner, request.request())
}

impl MemoryManager for LruMemoryManager {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn store_data(&self, owner: &str, mut item: DataItem) -> bool {
        let key = cache_key(owner, item.generating_request());
        let mut state = self.state.lock();

        // Items that are already cached cannot be stored again.
        if state.block(&key) {
            warn!(
                "store_data() for request {} declined, request key already exists",
                key
            );
            return false;
        }

        let item_kb = item.memory_size_kb();
        while state.usage_kb + item_kb > self.limit_kb {
            if state.evict_oldest().is_none() {
                break;
            }
        }

        if state.usage_kb + item_kb > self.limit_kb {
            warn!(
                "Memory manager '{}' exceeds its limit ({} + {} > {} kb); all remaining items are in use",
                self.identifier, state.usage_kb, item_kb, self.limit_kb
            );
        }

        item.mark_stored(&self.identifier, owner);
        state.active.insert(key.clone(), Arc::new(item));
        state.reference_counts.insert(key.clone(), 1);
        state.usage_kb += item_kb;

        debug!("Stored {} ({} kb) in '{}'", key, item_kb, self.identifier);
        true
    }

    fn contains_data(&self, owner: &str, request: &Request) -> bool {
        let key = cache_key(owner, request);
        let mut state = self.state.lock();
        if state.block(&key) {
            state.metrics.hits += 1;
            true
        } else {
            state.metrics.misses += 1;
            trace!("contains_data(): {} is not cached", key);
            false
        }
    }

    fn get_data(&self, owner: &str, request: &Request) -> Result<Arc<DataItem>, MemoryError> {
        let key = cache_key(owner, request);
        let state = self.state.lock();

        if let Some(item) = state.active.get(&key) {
            return Ok(Arc::clone(item));
        }

        if state.released.contains(&key) {
            return Err(MemoryError::not_active(key));
        }

        Err(MemoryError::not_cached(key))
    }

    fn release_data(&self, owner: &str, request: &Request) -> Result<(), MemoryError> {
        let key = cache_key(owner, request);
        let mut state = self.state.lock();

        if !state.active.contains_key(&key) {
            return Err(if state.released.contains(&key) {
                MemoryError::not_active(key)
            } else {
                MemoryError::not_cached(key)
            });
        }

        let remaining = match state.reference_counts.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        trace!("Releasing {}; reference counter set to {}", key, remaining);

        if remaining == 0 {
            if let Some(item) = state.active.remove(&key) {
                state.reference_counts.insert(key.clone(), 0);
                state.released.push(key, item);
            }
        }

        Ok(())
    }

    fn clear_cache(&self) {
        let mut state = self.state.lock();
        let mut cleared = 0usize;
        while state.evict_oldest().is_some() {
            cleared += 1;
        }
        info!(
            "Cleared {} released items from '{}' ({} kb still resident)",
            cleared, self.identifier, state.usage_kb
        );
    }

    fn status(&self) -> MemoryStatus {
        let state = self.state.lock();
        MemoryStatus {
            identifier: self.identifier.clone(),
            usage_kb: state.usage_kb,
            limit_kb: self.limit_kb,
            active_items: state.active.len(),
            released_items: state.released.len(),
        }
    }

    fn dump_memory_content(&self) -> String {
        let state = self.state.lock();
        let mut s = format!(
            "MEMORY CACHE CONTENT ({})\n===========================\nActive items:\n",
            self.identifier
        );

        let mut active: Vec<_> = state.active.iter().collect();
        active.sort_by(|a, b| a.0.cmp(b.0));
        for (key, item) in active {
            let _ = writeln!(
                s,
                "REQUEST: {}, SIZE: {} kb, REFERENCES: {}",
                key,
                item.memory_size_kb(),
                state.reference_counts.get(key).copied().unwrap_or(0)
            );
        }

        s.push_str("\nReleased items (in eviction order):\n");
        for (key, item) in state.released.iter().rev() {
            let _ = writeln!(s, "REQUEST: {}, SIZE: {} kb, REFERENCES: 0", key, item.memory_size_kb());
        }
        s.push_str("===========================\n");

        info!("{}", s);
        s
    }
}

impl std::fmt::Debug for LruMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruMemoryManager")
            .field("identifier", &self.identifier)
            .field("limit_kb", &self.limit_kb)
            .finish_non_exhaustive()
    }
}
