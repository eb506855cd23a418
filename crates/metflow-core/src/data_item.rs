//! Cacheable data items
//!
//! A [`DataItem`] wraps whatever a producer computed (a grid, a texture
//! handle, an analysis result) together with the bookkeeping the memory
//! manager needs: the request that generated it and, once stored, the
//! manager and owner it belongs to.

use std::any::Any;
use std::fmt;

use crate::request::Request;

/// Payload of a data item.
///
/// Implementors only need to report their memory footprint; the memory
/// manager accounts every payload against the same budget regardless of
/// whether it lives on the CPU or the GPU.
pub trait DataPayload: Any + Send + Sync + fmt::Debug {
    /// Approximate size in kilobytes.
    fn memory_size_kb(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

/// A produced result plus its cache bookkeeping.
#[derive(Debug)]
pub struct DataItem {
    generating_request: Request,
    stored: Option<StoredIn>,
    payload: Box<dyn DataPayload>,
}

/// Where a stored item lives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredIn {
    manager: String,
    owner: String,
}

impl DataItem {
    /// Wrap a freshly produced payload. The item is unmanaged until stored.
    pub fn new(payload: impl DataPayload) -> Self {
        Self {
            generating_request: Request::new(),
            stored: None,
            payload: Box::new(payload),
        }
    }

    /// The exact (key-filtered) request that produced this item.
    pub fn generating_request(&self) -> &Request {
        &self.generating_request
    }

    pub fn set_generating_request(&mut self, request: Request) {
        self.generating_request = request;
    }

    pub fn memory_size_kb(&self) -> u64 {
        self.payload.memory_size_kb()
    }

    /// Identifier of the memory manager holding this item, if any.
    pub fn memory_manager(&self) -> Option<&str> {
        self.stored.as_ref().map(|s| s.manager.as_str())
    }

    /// Identifier of the object that stored this item, if any.
    pub fn storing_owner(&self) -> Option<&str> {
        self.stored.as_ref().map(|s| s.owner.as_str())
    }

    pub fn is_managed(&self) -> bool {
        self.stored.is_some()
    }

    pub(crate) fn mark_stored(&mut self, manager: &str, owner: &str) {
        self.stored = Some(StoredIn {
            manager: manager.to_string(),
            owner: owner.to_string(),
        });
    }

    /// Downcast the payload.
    pub fn payload<T: DataPayload>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    pub fn payload_dyn(&self) -> &dyn DataPayload {
        self.payload.as_ref()
    }
}
