//! Key-value cache used by the active record layer.
//!
//! The engine only needs `get`/`set`/`delete`; [`MemoryCache`] is the
//! in-process implementation. Shared deployments plug in their own [`Cache`].

use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Cache: Send + Sync {
    /// `None` on a miss or an expired entry.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<JsonValue>>;

    /// Store `value`; a zero `ttl` never expires.
    fn set<'a>(&'a self, key: &'a str, value: JsonValue, ttl: Duration) -> BoxFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: JsonValue,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local cache with per-entry TTL. Expired entries are dropped on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CachedValue>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries, expired ones excluded.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| !entry.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl Cache for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<JsonValue>> {
        Box::pin(async move {
            let mut entries = lock(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.is_expired() => {
                    entries.remove(key);
                    None
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: JsonValue, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
            lock(&self.entries).insert(key.to_string(), CachedValue { value, expires_at });
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.entries).remove(key);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
