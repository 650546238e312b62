//! Local subscriber registry
//!
//! Maps a channel to the callbacks registered against it. The registry only
//! stores; deciding when a broker-level subscription must exist and where
//! callbacks run is up to the [`Listener`].
//!
//! [`Listener`]: crate::listener::Listener

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::Message;

/// A local subscriber. Identity is the allocation, so clone the `Arc` you
/// subscribed with when unsubscribing.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Whether two callbacks are the same registration
pub fn same_callback(a: &Callback, b: &Callback) -> bool {
    // compare data pointers only, vtable pointers are not guaranteed unique
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct SubscriberMap {
    subscribers: Mutex<HashMap<String, Vec<Callback>>>,
}

impl SubscriberMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Callback>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callback` on `channel`. Returns true if this is the first
    /// subscriber for the channel. Registering the same callback twice is a
    /// no-op.
    pub fn add(&self, channel: &str, callback: Callback) -> bool {
        let mut subscribers = self.lock();
        let callbacks = subscribers.entry(channel.to_string()).or_default();
        let first = callbacks.is_empty();
        if !callbacks.iter().any(|c| same_callback(c, &callback)) {
            callbacks.push(callback);
        }
        first
    }

    /// Removes `callback` from `channel`, returning how many subscribers
    /// remain. Unknown channels or callbacks are ignored.
    pub fn remove(&self, channel: &str, callback: &Callback) -> usize {
        let mut subscribers = self.lock();
        let Some(callbacks) = subscribers.get_mut(channel) else {
            return 0;
        };
        callbacks.retain(|c| !same_callback(c, callback));
        let remaining = callbacks.len();
        if remaining == 0 {
            subscribers.remove(channel);
        }
        remaining
    }

    /// Snapshot of the callbacks currently registered on `channel`
    pub fn subscribers(&self, channel: &str) -> Vec<Callback> {
        self.lock()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
