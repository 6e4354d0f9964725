//! A named-channel event bus.
//!
//! Components publish small string events ("online", ...) and other
//! components listen. A subscriber receives a [`Subscription`] guard;
//! dropping the guard (or calling [`Subscription::unsubscribe`]) removes
//! the callback, so a listener never outlives its owner. Notification
//! iterates over a snapshot of the subscriber list and tolerates concurrent
//! unsubscription.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct PubInner {
    channels: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// A named-channel event bus; see the module docs. Cloning shares the
/// channel table.
#[derive(Clone, Default)]
pub struct Publisher {
    inner: Arc<PubInner>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber to the named channel. The returned guard removes
    /// the subscription when dropped.
    #[must_use = "dropping the Subscription immediately unsubscribes"]
    pub fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.inner.channels.lock().expect("publisher lock poisoned");
        channels.entry(channel.to_string()).or_default().push(Entry {
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            channel: channel.to_string(),
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Sends `payload` to every subscriber of the channel, in subscription
    /// order. Subscriber panics are logged and contained.
    pub fn notify(&self, channel: &str, payload: &str) {
        let handlers: Vec<Handler> = {
            let channels = self.inner.channels.lock().expect("publisher lock poisoned");
            match channels.get(channel) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => return,
            }
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                tracing::error!(channel, "event subscriber panicked");
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .expect("publisher lock poisoned")
            .get(channel)
            .map_or(0, Vec::len)
    }
}

/// Guard tying a subscription to its owner's lifetime.
pub struct Subscription {
    channel: String,
    id: u64,
    inner: Weak<PubInner>,
}

impl Subscription {
    /// Removes the subscription now instead of at drop time.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut channels = inner.channels.lock().expect("publisher lock poisoned");
            if let Some(entries) = channels.get_mut(&self.channel) {
                entries.retain(|e| e.id != self.id);
                if entries.is_empty() {
                    channels.remove(&self.channel);
                }
            }
        }
    }
}
