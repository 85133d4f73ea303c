//! A small async key-value abstraction with TTL, an in-memory fallback,
//! and an optional Redis-compatible remote backend.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote cache connection error: {0}")]
    Connection(String),
    #[error("value could not be (de)serialized: {0}")]
    Serialization(String),
}

/// Values are opaque encoded blobs; the caller encodes/decodes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Convenience helpers layered over `CacheBackend` for JSON-serializable
/// values, used by the Permission Engine and `JailStatusCache`.
#[async_trait]
pub trait TypedCache: CacheBackend {
    async fn get_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, bytes, ttl).await
    }
}

impl<T: CacheBackend + ?Sized> TypedCache for T {}
