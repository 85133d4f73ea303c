//! Redis-compatible remote `CacheBackend`.
//!
//! All keys are namespaced under `"tux:"` so this process can coexist with
//! other tenants of the same Redis/Valkey instance; a key that already
//! carries the prefix is not doubled. Values are JSON on the wire. Failures
//! are reported as `CacheError` rather than panicking so callers (the
//! Permission Engine) can fall back to `InMemoryCache`.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;

const NAMESPACE: &str = "tux:";

pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self { manager })
    }

    fn namespaced(key: &str) -> String {
        if key.starts_with(NAMESPACE) {
            key.to_string()
        } else {
            format!("{NAMESPACE}{key}")
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(Self::namespaced(key))
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        match raw {
            Some(s) => Ok(Some(s.into_bytes())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let value = String::from_utf8(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let key = Self::namespaced(key);
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, secs)
                    .await
                    .map_err(|e| CacheError::Connection(e.to_string()))?;
            }
            None => {
                conn.set::<_, _, ()>(key, value)
                    .await
                    .map_err(|e| CacheError::Connection(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(Self::namespaced(key))
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let exists: bool = conn
            .exists(Self::namespaced(key))
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(exists)
    }
}
