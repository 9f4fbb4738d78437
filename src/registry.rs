//! Subscription registry.
//!
//! DESIGN
//! ======
//! Listeners are stored per topic key behind one mutex and addressed by opaque
//! handles, so callers never have to hand back the closure to unsubscribe.
//! The registry outlives individual connections; the session replays
//! `topics()` to the server after every successful authentication.
//!
//! `publish` never runs listener code on the caller's task. Each listener gets
//! its own spawned task with the panic caught inside it, so a slow or broken
//! listener cannot stall the frame loop or starve its siblings.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::{Event, WILDCARD_TOPIC};

/// Callback invoked with every event published under its topic.
pub type Listener = Arc<dyn Fn(Event) + Send + Sync>;

/// Opaque token returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_handle: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(SubscriptionHandle, Listener)>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: impl Into<String>, listener: Listener) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(topic.into()).or_default().push((handle, listener));
        handle
    }

    /// Remove a listener. Returns its topic, or `None` for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Option<String> {
        let mut topics = self.lock();
        let topic = topics
            .iter()
            .find(|(_, listeners)| listeners.iter().any(|(h, _)| *h == handle))
            .map(|(topic, _)| topic.clone())?;
        if let Some(listeners) = topics.get_mut(&topic) {
            listeners.retain(|(h, _)| *h != handle);
            if listeners.is_empty() {
                topics.remove(&topic);
            }
        }
        Some(topic)
    }

    /// Every topic with at least one listener, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics = self.lock().keys().cloned().collect::<Vec<_>>();
        topics.sort();
        topics
    }

    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    /// Listeners of `topic` followed by wildcard listeners.
    #[must_use]
    pub fn listeners_for(&self, topic: &str) -> Vec<Listener> {
        let topics = self.lock();
        let exact = topics.get(topic).into_iter().flatten();
        let wildcard = if topic == WILDCARD_TOPIC { None } else { topics.get(WILDCARD_TOPIC) };
        exact.chain(wildcard.into_iter().flatten()).map(|(_, listener)| listener.clone()).collect()
    }

    /// Dispatch `event` to every matching listener on its own task.
    /// Returns the number of listeners notified.
    pub fn publish(&self, event: &Event) -> usize {
        let listeners = self.listeners_for(&event.topic);
        let count = listeners.len();
        for listener in listeners {
            let event = event.clone();
            tokio::spawn(async move {
                let topic = event.topic.clone();
                if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    tracing::warn!(%topic, "registry: listener panicked");
                }
            });
        }
        tracing::debug!(topic = %event.topic, listeners = count, "registry: published");
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(SubscriptionHandle, Listener)>>> {
        self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
