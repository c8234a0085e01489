use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StorageError;

/// eTag meaning "overwrite regardless of the stored version".
pub const ANY_ETAG: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    pub value: Value,
    #[serde(rename = "eTag", default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

impl StoreItem {
    pub fn new(value: Value) -> Self {
        Self { value, e_tag: None }
    }

    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, StorageError> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    pub fn with_e_tag(mut self, e_tag: impl Into<String>) -> Self {
        self.e_tag = Some(e_tag.into());
        self
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Key/value persistence with optimistic concurrency on eTags.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Missing keys are absent from the result.
    async fn read(&self, keys: &[String]) -> Result<HashMap<String, StoreItem>, StorageError>;

    /// Writes without an eTag, or with `*`, are unconditional. Any other eTag
    /// must match the stored one or the whole write fails with a conflict.
    async fn write(&self, changes: HashMap<String, StoreItem>) -> Result<(), StorageError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, StoreItem>>,
    next_e_tag: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn e_tag(&self) -> String {
        (self.next_e_tag.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, keys: &[String]) -> Result<HashMap<String, StoreItem>, StorageError> {
        if keys.iter().any(|key| key.is_empty()) {
            return Err(StorageError::EmptyKey);
        }
        let items = self.items.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| items.get(key).map(|item| (key.clone(), item.clone())))
            .collect())
    }

    async fn write(&self, changes: HashMap<String, StoreItem>) -> Result<(), StorageError> {
        let mut items = self.items.write().await;
        for (key, change) in &changes {
            if key.is_empty() {
                return Err(StorageError::EmptyKey);
            }
            let expected = change
                .e_tag
                .as_deref()
                .filter(|e_tag| !e_tag.is_empty() && *e_tag != ANY_ETAG);
            if let (Some(expected), Some(stored)) = (expected, items.get(key))
                && stored.e_tag.as_deref() != Some(expected)
            {
                return Err(StorageError::ETagConflict { key: key.clone() });
            }
        }
        for (key, change) in changes {
            let e_tag = self.e_tag();
            items.insert(key, change.with_e_tag(e_tag));
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut items = self.items.write().await;
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }
}
