//! In-memory value store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{StoreError, StoreRequest, StoreResponse, StoredValue, ValueStore};

/// Attempts to take the write lock before reporting `Busy`.
const WRITE_ATTEMPTS: usize = 8;

/// Process-local store backed by a sorted map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check for no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn write<R>(
        &self,
        op: impl FnOnce(&mut BTreeMap<String, StoredValue>) -> R,
    ) -> Result<R, StoreError> {
        for _ in 0..WRITE_ATTEMPTS {
            if let Ok(mut entries) = self.entries.try_write() {
                return Ok(op(&mut entries));
            }
            tokio::task::yield_now().await;
        }
        Err(StoreError::Busy)
    }
}

#[async_trait]
impl ValueStore for MemoryStore {
    async fn request(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        match request {
            StoreRequest::Get { key } => {
                let entries = self.entries.read().await;
                Ok(StoreResponse::Value(entries.get(&key).cloned()))
            }
            StoreRequest::Put { key, value } => {
                debug!("store put {}", key);
                self.write(|entries| entries.insert(key, value)).await?;
                Ok(StoreResponse::Done)
            }
            StoreRequest::Delete { key } => {
                self.write(|entries| entries.remove(&key)).await?;
                Ok(StoreResponse::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        store.put("a/score", StoredValue::Int(3)).await.unwrap();
        assert_eq!(store.get("a/score").await.unwrap(), Some(StoredValue::Int(3)));

        store.request(StoreRequest::Delete { key: "a/score".into() }).await.unwrap();
        assert_eq!(store.get("a/score").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_contention_reports_busy() {
        let store = MemoryStore::new();
        let _reader = store.entries.read().await;

        let result = store.put("k", StoredValue::Text("v".into())).await;
        assert_eq!(result, Err(StoreError::Busy));
    }
}
