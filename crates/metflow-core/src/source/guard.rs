use std::ops::Deref;
use std::sync::Arc;

use tracing::warn;

use super::DataSource;
use crate::data_item::DataItem;
use crate::error::Result;
use crate::request::Request;

/// Scoped access to a completed item. The reservation is released on drop.
pub struct DataGuard<'a> {
    source: &'a dyn DataSource,
    request: Request,
    item: Arc<DataItem>,
}

impl<'a> DataGuard<'a> {
    /// Take over the reservation of a completed request.
    pub fn acquire(source: &'a dyn DataSource, request: &Request) -> Result<Self> {
        let item = source.get_data(request)?;
        Ok(Self {
            source,
            request: request.clone(),
            item,
        })
    }

    /// Acquire all requests or none.
    ///
    /// If one request fails, the requests after it are released unseen and
    /// the guards acquired so far are dropped, so no reservation leaks.
    pub fn acquire_all(source: &'a dyn DataSource, requests: &[Request]) -> Result<Vec<Self>> {
        let mut guards = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            match Self::acquire(source, request) {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    for rest in &requests[i + 1..] {
                        if let Err(release_err) = source.release_data(rest) {
                            warn!("Failed to release {}: {}", rest, release_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(guards)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn item(&self) -> &Arc<DataItem> {
        &self.item
    }
}

impl Deref for DataGuard<'_> {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for DataGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.source.release_data(&self.request) {
            warn!("Failed to release {} on {}: {}", self.request, self.source.id(), e);
        }
    }
}
