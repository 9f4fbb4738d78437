//! Last-known remote state.
//!
//! Entries are written by push events and bulk refreshes and survive
//! reconnects as "last known" until fresher data overwrites them. Reads hand
//! out clones, so a caller never observes a half-applied merge.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::message::{Event, EventValue};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub key: String,
    pub value: Value,
    pub last_updated: Instant,
}

impl CachedEntity {
    #[must_use]
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_updated)
    }
}

#[derive(Debug, Default)]
pub struct StateCache {
    entries: Mutex<HashMap<String, CachedEntity>>,
}

impl StateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event's value. Returns `false` for signals, which carry none.
    pub fn apply(&self, event: &Event) -> bool {
        self.apply_at(event, Instant::now())
    }

    pub fn apply_at(&self, event: &Event, now: Instant) -> bool {
        match &event.value {
            EventValue::Full(value) => {
                self.upsert_at(&event.topic, value.clone(), now);
                true
            }
            EventValue::Partial(fields) => {
                self.merge_at(&event.topic, fields, now);
                true
            }
            EventValue::Signal(_) => false,
        }
    }

    pub fn upsert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.upsert_at(&key, value, Instant::now());
    }

    /// Bulk-load `(key, value)` pairs. Returns how many were written.
    pub fn load(&self, entries: Vec<(String, Value)>) -> usize {
        let now = Instant::now();
        let mut map = self.lock();
        let count = entries.len();
        for (key, value) in entries {
            map.insert(key.clone(), CachedEntity { key, value, last_updated: now });
        }
        count
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedEntity> {
        self.lock().get(key).cloned()
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        self.lock().get(key).map(|entity| entity.value.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock().iter().map(|(key, entity)| (key.clone(), entity.value.clone())).collect()
    }

    /// Cached keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Missing entries count as stale.
    #[must_use]
    pub fn is_stale(&self, key: &str, max_age: Duration) -> bool {
        self.is_stale_at(key, max_age, Instant::now())
    }

    #[must_use]
    pub fn is_stale_at(&self, key: &str, max_age: Duration, now: Instant) -> bool {
        self.lock().get(key).is_none_or(|entity| entity.age_at(now) > max_age)
    }

    fn upsert_at(&self, key: &str, value: Value, now: Instant) {
        self.lock().insert(key.to_owned(), CachedEntity { key: key.to_owned(), value, last_updated: now });
    }

    fn merge_at(&self, key: &str, fields: &Map<String, Value>, now: Instant) {
        let mut map = self.lock();
        let entity = map.entry(key.to_owned()).or_insert_with(|| CachedEntity {
            key: key.to_owned(),
            value: Value::Object(Map::new()),
            last_updated: now,
        });
        if !entity.value.is_object() {
            entity.value = Value::Object(Map::new());
        }
        if let Value::Object(existing) = &mut entity.value {
            for (field, value) in fields {
                existing.insert(field.clone(), value.clone());
            }
        }
        entity.last_updated = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedEntity>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
