//! Broadcast of pipeline notifications to any number of listeners.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Fan-out of events to all live subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next emit.
#[derive(Debug)]
pub struct EventHub<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> EventHub<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new listener. Events emitted before this call are not seen.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}
