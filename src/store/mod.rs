//! Value Store
//!
//! Opaque request/response persistence used by objects that keep state
//! (accounts). The object layer never interprets store errors; they cross
//! the call boundary as `CallError::Storage` carrying the store's message.

pub mod memory;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::error::CallError;

pub use memory::MemoryStore;

/// A stored scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Text(String),
    /// Bytes.
    Blob(Vec<u8>),
}

impl StoredValue {
    /// Kind name for cast errors.
    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Int(_) => "int",
            StoredValue::Float(_) => "float",
            StoredValue::Text(_) => "text",
            StoredValue::Blob(_) => "blob",
        }
    }

    /// Integer payload or a cast error.
    pub fn expect_int(&self) -> Result<i64, StoreError> {
        match self {
            StoredValue::Int(i) => Ok(*i),
            other => Err(StoreError::Cast { expected: "int", found: other.kind() }),
        }
    }
}

/// Store request.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    /// Read a key.
    Get {
        /// Key.
        key: String,
    },
    /// Write a key.
    Put {
        /// Key.
        key: String,
        /// New value.
        value: StoredValue,
    },
    /// Remove a key.
    Delete {
        /// Key.
        key: String,
    },
}

/// Store response.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResponse {
    /// Read result.
    Value(Option<StoredValue>),
    /// Write or delete completed.
    Done,
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Write contention; retry later.
    #[error("database is locked")]
    Busy,

    /// Stored value has a different kind than requested.
    #[error("cast failed: expected {expected}, found {found}")]
    Cast {
        /// Requested kind.
        expected: &'static str,
        /// Stored kind.
        found: &'static str,
    },

    /// Backend failure.
    #[error("store: {0}")]
    Db(String),
}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        CallError::Storage(err.to_string())
    }
}

/// Asynchronous key/value persistence.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Execute one request.
    async fn request(&self, request: StoreRequest) -> Result<StoreResponse, StoreError>;

    /// Read `key`.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        match self.request(StoreRequest::Get { key: key.to_string() }).await? {
            StoreResponse::Value(value) => Ok(value),
            StoreResponse::Done => Err(StoreError::Db("unexpected response to get".into())),
        }
    }

    /// Write `key`.
    async fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.request(StoreRequest::Put { key: key.to_string(), value }).await?;
        Ok(())
    }
}
