//! Memory management for data items
//!
//! A memory manager maps requests to [`DataItem`]s and keeps every item that
//! is still referenced resident. Clients follow a strict sequence:
//!
//! ```text
//! store_data | contains_data   (blocks the item, +1 reference)
//!         │
//!         ▼
//!      get_data                (no change to the reference count)
//!         │
//!         ▼
//!    release_data              (-1 reference; at 0 the item is "released")
//! ```
//!
//! Released items stay cached until the budget needs the room, so a repeated
//! request can be served without recomputation.

mod cache;

pub use cache::{CacheMetrics, LruMemoryManager, DEFAULT_MEMORY_LIMIT_KB};

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::data_item::DataItem;
use crate::request::Request;

/// Contract violations reported by a memory manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request is not cached at all
    #[error("data item '{key}' is not stored in the memory manager")]
    NotCached { key: String },

    /// The request is cached but was released; call `contains_data` first
    #[error("data item '{key}' is cached but not active; call contains_data() before get_data()")]
    NotActive { key: String },

    /// The item was never stored
    #[error("data item for '{request}' is not managed by any memory manager")]
    Unmanaged { request: String },
}

impl MemoryError {
    pub fn not_cached(key: impl Into<String>) -> Self {
        Self::NotCached { key: key.into() }
    }

    pub fn not_active(key: impl Into<String>) -> Self {
        Self::NotActive { key: key.into() }
    }
}

/// Snapshot of a memory manager's usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub identifier: String,
    pub usage_kb: u64,
    pub limit_kb: u64,
    pub active_items: usize,
    pub released_items: usize,
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} MiB ({} active / {} released)",
            self.usage_kb / 1024,
            self.limit_kb / 1024,
            self.active_items,
            self.released_items
        )
    }
}

/// Thread-safe, reference-counted store for data items.
///
/// `owner` scopes the cache key so that equal requests issued by different
/// sources never share an entry.
pub trait MemoryManager: Send + Sync {
    /// Name used in logs and status reports.
    fn identifier(&self) -> &str;

    /// Store a new item under its generating request.
    ///
    /// Returns `false` if the request is already present. The existing entry
    /// is blocked anyway, and the caller must drop its own item and use
    /// [`get_data`](Self::get_data) instead.
    fn store_data(&self, owner: &str, item: DataItem) -> bool;

    /// Block the item for `request` if it is cached (active or released).
    fn contains_data(&self, owner: &str, request: &Request) -> bool;

    /// Access a blocked item. Does not change its reference count.
    fn get_data(&self, owner: &str, request: &Request) -> Result<Arc<DataItem>, MemoryError>;

    /// Drop one reference. At zero the item moves to the released pool.
    fn release_data(&self, owner: &str, request: &Request) -> Result<(), MemoryError>;

    /// Release an item through the owner recorded when it was stored.
    fn release_item(&self, item: &DataItem) -> Result<(), MemoryError> {
        let owner = item.storing_owner().ok_or_else(|| MemoryError::Unmanaged {
            request: item.generating_request().to_string(),
        })?;
        self.release_data(owner, item.generating_request())
    }

    /// Delete all released items. Active items are not affected.
    fn clear_cache(&self);

    fn status(&self) -> MemoryStatus;

    /// Human-readable listing of the cache content.
    fn dump_memory_content(&self) -> String;
}
