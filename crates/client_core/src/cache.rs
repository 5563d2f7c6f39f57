use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use shared::domain::{GroupId, ItemId};
use tracing::warn;

/// Device-local synchronous string store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn messages(group_id: &GroupId) -> Self {
        Self(format!("chat:{group_id}:messages"))
    }

    pub fn extras(group_id: &GroupId, item_id: &ItemId) -> Self {
        Self(format!("extras:{group_id}:{item_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON view over a [`KeyValueStore`]. Entries that no longer decode are
/// reported as absent.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    pub fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self.store.get(key.as_str())?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(%key, %error, "cache: ignoring undecodable entry");
                None
            }
        }
    }

    pub fn write<T: Serialize>(&self, key: &CacheKey, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.store.set(key.as_str(), raw),
            Err(error) => warn!(%key, %error, "cache: failed to encode entry"),
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        self.store.remove(key.as_str());
    }
}
