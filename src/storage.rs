//! The storage port and the typed store built on top of it.
//!
//! The backing key-value store is supplied by the outer client. Records are
//! JSON strings namespaced under `wc@2:core:<store-name>:<key>` so multiple
//! clients can share one backend.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::constants::STORAGE_PREFIX;
use crate::error::{Error, Result};

/// Durable key-value store with prefix scan.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory backend used by tests and short-lived clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().expect("storage lock").get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner
            .lock()
            .expect("storage lock")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().expect("storage lock").remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .expect("storage lock")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Typed durable map for one record kind.
///
/// Writes go to the backend before the call returns; the in-memory cache only
/// mirrors what is persisted.
pub struct Store<V> {
    name: String,
    prefix: String,
    storage: Arc<dyn KeyValueStorage>,
    cache: Mutex<HashMap<String, V>>,
    _marker: PhantomData<V>,
}

impl<V> Store<V>
where
    V: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn new(storage: Arc<dyn KeyValueStorage>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: format!("{STORAGE_PREFIX}:{name}"),
            storage,
            cache: Mutex::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    /// Loads every persisted record of this store into the cache.
    pub async fn init(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.clear();
        for storage_key in self.storage.keys(&self.prefix).await? {
            let Some(raw) = self.storage.get(&storage_key).await? else {
                continue;
            };
            let key = storage_key[self.prefix.len() + 1..].to_string();
            match serde_json::from_str::<V>(&raw) {
                Ok(value) => {
                    cache.insert(key, value);
                }
                Err(e) => {
                    debug!("store {}: dropping unreadable record {key}: {e}", self.name);
                }
            }
        }
        Ok(())
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    /// Inserts or replaces a record.
    pub async fn set(&self, key: &str, value: V) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        self.storage.set(&self.storage_key(key), raw).await?;
        self.cache.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    /// Inserts a record, failing with `AlreadyExists` if the key is taken.
    pub async fn create(&self, key: &str, value: V) -> Result<()> {
        if self.cache.lock().await.contains_key(key) {
            return Err(Error::AlreadyExists(format!("{}:{key}", self.name)));
        }
        self.set(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<V> {
        self.cache
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NoMatchingKey(format!("{}:{key}", self.name)))
    }

    pub async fn has(&self, key: &str) -> bool {
        self.cache.lock().await.contains_key(key)
    }

    /// Shallow-merges `partial` into the stored record. Fields absent from
    /// `partial` are preserved, including ones this version does not model.
    pub async fn update(&self, key: &str, partial: Value) -> Result<V> {
        let current = self.get(key).await?;
        let mut base = serde_json::to_value(&current)?;
        if let (Value::Object(base), Value::Object(partial)) = (&mut base, partial) {
            for (field, value) in partial {
                base.insert(field, value);
            }
        }
        let merged: V = serde_json::from_value(base)?;
        self.set(key, merged.clone()).await?;
        Ok(merged)
    }

    pub async fn delete(&self, key: &str, reason: &str) -> Result<()> {
        if self.cache.lock().await.remove(key).is_none() {
            return Err(Error::NoMatchingKey(format!("{}:{key}", self.name)));
        }
        debug!("store {}: deleting {key} ({reason})", self.name);
        self.storage.delete(&self.storage_key(key)).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.cache.lock().await.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<V> {
        self.cache.lock().await.values().cloned().collect()
    }

    pub async fn get_all(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.cache
            .lock()
            .await
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        count: u32,
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    }

    fn record(name: &str, count: u32) -> Record {
        Record {
            name: name.to_string(),
            count,
            extra: serde_json::Map::new(),
        }
    }

    fn store() -> Store<Record> {
        Store::new(Arc::new(MemoryStorage::new()), "test")
    }

    #[tokio::test]
    async fn set_get_delete() {
        let store = store();
        store.set("a", record("a", 1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), record("a", 1));

        store.delete("a", "test teardown").await.unwrap();
        assert!(matches!(
            store.get("a").await.unwrap_err(),
            Error::NoMatchingKey(_)
        ));
        assert!(matches!(
            store.delete("a", "again").await.unwrap_err(),
            Error::NoMatchingKey(_)
        ));
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = store();
        store.create("a", record("a", 1)).await.unwrap();
        assert!(matches!(
            store.create("a", record("a", 2)).await.unwrap_err(),
            Error::AlreadyExists(_)
        ));
        // the original record is untouched
        assert_eq!(store.get("a").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn update_merges_shallowly() {
        let store = store();
        store.set("a", record("a", 1)).await.unwrap();
        let merged = store.update("a", json!({"count": 5})).await.unwrap();
        assert_eq!(merged.name, "a");
        assert_eq!(merged.count, 5);
    }

    #[tokio::test]
    async fn update_preserves_unknown_fields() {
        let store = store();
        let mut rec = record("a", 1);
        rec.extra.insert("future".to_string(), json!("kept"));
        store.set("a", rec).await.unwrap();

        let merged = store.update("a", json!({"count": 2})).await.unwrap();
        assert_eq!(merged.extra["future"], json!("kept"));
    }

    #[tokio::test]
    async fn init_rehydrates_from_backend() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        {
            let store: Store<Record> = Store::new(storage.clone(), "test");
            store.set("a", record("a", 1)).await.unwrap();
        }
        let store: Store<Record> = Store::new(storage, "test");
        assert!(store.is_empty().await);
        store.init().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), record("a", 1));
    }
}
