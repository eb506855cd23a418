//! Memory-managed sources
//!
//! [`MemoryManagedCore`] holds the state every cached source shares: its
//! identity, memory manager, registered inputs and pass-through target.
//! Requests are reduced to the required keys before they touch the cache, so
//! that spurious keys never produce duplicate items.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use super::{DataEvent, DataProducer, DataSource};
use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::events::EventHub;
use crate::memory::{MemoryError, MemoryManager};
use crate::request::Request;

static NEXT_SOURCE_NUMBER: AtomicU64 = AtomicU64::new(1);

/// Shared state of sources that cache their results.
pub struct MemoryManagedCore {
    id: String,
    local_keys: Vec<String>,
    memory_manager: OnceCell<Arc<dyn MemoryManager>>,
    inputs: RwLock<Vec<(String, Arc<dyn DataSource>)>>,
    required_keys: RwLock<Option<Vec<String>>>,
    pass_through: RwLock<Option<Arc<dyn DataSource>>>,
}

impl MemoryManagedCore {
    /// Create the core of a source. `name` is made unique by a counter suffix.
    pub fn new(name: &str, local_keys: Vec<String>) -> Self {
        let number = NEXT_SOURCE_NUMBER.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{}#{}", name, number),
            local_keys,
            memory_manager: OnceCell::new(),
            inputs: RwLock::new(Vec::new()),
            required_keys: RwLock::new(None),
            pass_through: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn locally_required_keys(&self) -> &[String] {
        &self.local_keys
    }

    /// Assign the memory manager. It cannot be changed afterwards.
    pub fn set_memory_manager(&self, manager: Arc<dyn MemoryManager>) -> Result<()> {
        self.memory_manager
            .set(manager)
            .map_err(|_| PipelineError::MemoryManagerAlreadySet {
                source_id: self.id.clone(),
            })
    }

    pub fn memory_manager(&self) -> Result<&Arc<dyn MemoryManager>> {
        self.memory_manager
            .get()
            .ok_or_else(|| PipelineError::MissingMemoryManager(self.id.clone()))
    }

    /// Register an input whose required keys become part of ours.
    ///
    /// Without prefix the same source is added once; with a prefix the source
    /// replaces any source registered under it, and its keys are required as
    /// `prefix + key`.
    pub fn register_input_source(&self, source: Arc<dyn DataSource>, prefix: &str) {
        {
            let mut inputs = self.inputs.write();
            if prefix.is_empty() {
                let known = inputs
                    .iter()
                    .any(|(p, s)| p.is_empty() && s.id() == source.id());
                if !known {
                    inputs.push((String::new(), source));
                }
            } else if let Some(entry) = inputs.iter_mut().find(|(p, _)| p == prefix) {
                entry.1 = source;
            } else {
                inputs.push((prefix.to_string(), source));
            }
        }
        *self.required_keys.write() = None;
    }

    /// Remove all prefixed inputs; inputs without prefix stay registered.
    pub fn deregister_prefixed_input_sources(&self) {
        self.inputs.write().retain(|(prefix, _)| prefix.is_empty());
        *self.required_keys.write() = None;
    }

    pub fn get_prefixed_data_source(&self, prefix: &str) -> Option<Arc<dyn DataSource>> {
        self.inputs
            .read()
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, s)| Arc::clone(s))
    }

    /// Forward requests that lack a locally required key to `next`.
    pub fn enable_pass_through(&self, next: Arc<dyn DataSource>) {
        *self.pass_through.write() = Some(next);
    }

    pub fn pass_through(&self) -> Option<Arc<dyn DataSource>> {
        self.pass_through.read().clone()
    }

    /// Local keys followed by the keys of all registered inputs.
    pub fn required_keys(&self) -> Vec<String> {
        if let Some(keys) = self.required_keys.read().as_ref() {
            return keys.clone();
        }

        let mut keys = self.local_keys.clone();
        for (prefix, source) in self.inputs.read().iter() {
            for key in source.required_keys() {
                let key = format!("{}{}", prefix, key);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        *self.required_keys.write() = Some(keys.clone());
        keys
    }

    /// Whether this source handles `request` itself.
    pub fn handles(&self, request: &Request) -> bool {
        request.contains_all(&self.local_keys)
    }

    /// Reduce a request to the keys that influence the result.
    pub fn filter_request(&self, request: &Request) -> Request {
        let mut filtered = request.clone();
        filtered.remove_all_keys_except(&self.required_keys());
        filtered
    }

    fn forward(&self, request: &Request) -> Option<Arc<dyn DataSource>> {
        if self.handles(request) {
            None
        } else {
            self.pass_through()
        }
    }

    pub fn get_data(&self, request: &Request) -> Result<Arc<DataItem>> {
        if let Some(next) = self.forward(request) {
            return next.get_data(request);
        }
        let filtered = self.filter_request(request);
        Ok(self.memory_manager()?.get_data(&self.id, &filtered)?)
    }

    pub fn release_data(&self, request: &Request) -> Result<()> {
        if let Some(next) = self.forward(request) {
            return next.release_data(request);
        }
        let filtered = self.filter_request(request);
        Ok(self.memory_manager()?.release_data(&self.id, &filtered)?)
    }

    /// Block an available item for `n` more consumers.
    pub fn reserve_data(&self, request: &Request, n: usize) -> Result<()> {
        if let Some(next) = self.forward(request) {
            return next.reserve_data(request, n);
        }
        let filtered = self.filter_request(request);
        let manager = self.memory_manager()?;
        for _ in 0..n {
            if !manager.contains_data(&self.id, &filtered) {
                return Err(MemoryError::not_cached(format!("{}/{}", self.id, filtered)).into());
            }
        }
        trace!("Reserved {} for {} more consumers", filtered, n);
        Ok(())
    }
}

/// Source that produces synchronously inside `request_data`.
///
/// Requests are forwarded to a pass-through target with the same call, so
/// the target should be synchronous as well.
pub struct MemoryManagedDataSource {
    core: MemoryManagedCore,
    producer: Box<dyn DataProducer>,
    events: EventHub<DataEvent>,
}

impl MemoryManagedDataSource {
    pub fn new(name: &str, producer: impl DataProducer + 'static) -> Self {
        let core = MemoryManagedCore::new(name, producer.locally_required_keys());
        for (prefix, input) in producer.input_sources() {
            core.register_input_source(input, &prefix);
        }
        Self {
            core,
            producer: Box::new(producer),
            events: EventHub::new(),
        }
    }

    pub fn core(&self) -> &MemoryManagedCore {
        &self.core
    }

    pub fn set_memory_manager(&self, manager: Arc<dyn MemoryManager>) -> Result<()> {
        self.core.set_memory_manager(manager)
    }

    pub fn enable_pass_through(&self, next: Arc<dyn DataSource>) {
        self.core.enable_pass_through(next);
    }

    pub fn register_input_source(&self, source: Arc<dyn DataSource>, prefix: &str) {
        self.core.register_input_source(source, prefix);
    }
}

impl DataSource for MemoryManagedDataSource {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn request_data(&self, request: &Request) -> Result<()> {
        if let Some(next) = self.core.forward(request) {
            next.request_data(request)?;
            self.events.emit(DataEvent::Completed(request.clone()));
            return Ok(());
        }
        if !self.core.handles(request) {
            let err = PipelineError::missing_keys(request.request(), self.core.locally_required_keys());
            error!("{}", err);
            return Err(err);
        }

        let manager = self.core.memory_manager()?;
        let filtered = self.core.filter_request(request);

        if manager.contains_data(self.id(), &filtered) {
            debug!("{}: {} served from cache", self.id(), filtered);
            self.events.emit(DataEvent::Completed(request.clone()));
            return Ok(());
        }

        match self.producer.produce_data(&filtered) {
            Ok(mut item) => {
                item.set_generating_request(filtered);
                // A false store means another caller stored the same item;
                // it is blocked for us either way.
                manager.store_data(self.id(), item);
                self.events.emit(DataEvent::Completed(request.clone()));
            }
            Err(e) => {
                error!("{}: {}", self.id(), e);
                self.events.emit(DataEvent::Failed {
                    request: request.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>> {
        self.core.get_data(request)
    }

    fn release_data(&self, request: &Request) -> Result<()> {
        self.core.release_data(request)
    }

    fn reserve_data(&self, request: &Request, n: usize) -> Result<()> {
        self.core.reserve_data(request, n)
    }

    fn required_keys(&self) -> Vec<String> {
        self.core.required_keys()
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.core.locally_required_keys().to_vec()
    }

    fn subscribe(&self) -> Receiver<DataEvent> {
        self.events.subscribe()
    }
}
