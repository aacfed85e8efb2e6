use crate::config::{CacheStore, SessionConfig};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod memory;
pub mod null;
pub mod redis;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to serialize value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to parse value: {0}")]
    Deserialization(String),
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Key/value store persisting session bags between requests.
///
/// Values are stored as JSON and expire after the configured session TTL.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store a value under `key`, resetting its TTL
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T)
        -> Result<(), CacheError>;

    /// Retrieve a value, `None` when missing or expired
    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError>;

    /// Check connectivity to the backend
    async fn health_check(&self) -> Result<(), String>;

    /// Delete a value
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Session store selected at runtime from [`SessionConfig::store`]
#[derive(Clone)]
pub enum Cache {
    /// Process-local store using Moka
    InMemory(memory::InMemoryCache),
    /// Redis store shared between processes
    Redis(redis::RedisCache),
    /// Store that forgets everything; every request starts a new session
    Null(null::NullCache),
}

#[async_trait::async_trait]
impl CacheBackend for Cache {
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        match self {
            Self::InMemory(cache) => cache.set(key, value).await,
            Self::Redis(cache) => cache.set(key, value).await,
            Self::Null(cache) => cache.set(key, value).await,
        }
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self {
            Self::InMemory(cache) => cache.get(key).await,
            Self::Redis(cache) => cache.get(key).await,
            Self::Null(cache) => cache.get(key).await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::InMemory(cache) => cache.health_check().await,
            Self::Redis(cache) => cache.health_check().await,
            Self::Null(cache) => cache.health_check().await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            Self::InMemory(cache) => cache.delete(key).await,
            Self::Redis(cache) => cache.delete(key).await,
            Self::Null(cache) => cache.delete(key).await,
        }
    }
}

/// Create the session store selected by the configuration.
pub async fn create_cache(config: &SessionConfig) -> Result<Cache, CacheError> {
    match config.store {
        CacheStore::InMemory => {
            let cache = memory::InMemoryCache::new(config.ttl, config.memory.capacity)
                .map_err(CacheError::Config)?;
            Ok(Cache::InMemory(cache))
        }
        CacheStore::Redis => {
            let url = match config.redis.url.as_deref() {
                Some(url) if !url.is_empty() => url,
                _ => {
                    return Err(CacheError::Config(
                        "Redis URL is required for the Redis session store".to_string(),
                    ))
                }
            };
            let cache = redis::RedisCache::new(url, config.ttl)
                .await
                .map_err(CacheError::Config)?;
            Ok(Cache::Redis(cache))
        }
        CacheStore::None => Ok(Cache::Null(null::NullCache::new())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credential::SavedCredential;
    use std::time::Duration;

    fn saved_credential(token: &str) -> SavedCredential {
        SavedCredential {
            access_token: Some(token.to_string()),
            expires: Some(1_700_000_000),
            session_key: None,
            uid: Some("42".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = Cache::InMemory(memory::InMemoryCache::new(60, 128).unwrap());

        let value = saved_credential("tok");
        cache.set("session:a", &value).await.unwrap();
        let stored: Option<SavedCredential> = cache.get("session:a").await.unwrap();
        assert_eq!(stored, Some(value));

        let missing: Option<SavedCredential> = cache.get("session:missing").await.unwrap();
        assert_eq!(missing, None);

        cache.delete("session:a").await.unwrap();
        let deleted: Option<SavedCredential> = cache.get("session:a").await.unwrap();
        assert_eq!(deleted, None);
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let cache = Cache::InMemory(memory::InMemoryCache::new(1, 128).unwrap());

        cache.set("session:ttl", &saved_credential("tok")).await.unwrap();
        assert!(cache
            .get::<SavedCredential>("session:ttl")
            .await
            .unwrap()
            .is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(cache
            .get::<SavedCredential>("session:ttl")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_in_memory_cache() {
        let config = SessionConfig::default();
        let cache = create_cache(&config).await.unwrap();
        assert!(matches!(cache, Cache::InMemory(_)));
        assert!(cache.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_create_null_cache() {
        let config = SessionConfig {
            store: CacheStore::None,
            ..Default::default()
        };
        let cache = create_cache(&config).await.unwrap();
        assert!(matches!(cache, Cache::Null(_)));
    }

    #[tokio::test]
    async fn test_create_redis_cache_requires_url() {
        let config = SessionConfig {
            store: CacheStore::Redis,
            ..Default::default()
        };
        let result = create_cache(&config).await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_cache_concurrent_sessions() {
        let cache = Cache::InMemory(memory::InMemoryCache::new(60, 128).unwrap());
        let writer = cache.clone();

        let set_task = tokio::spawn(async move {
            for i in 0..100 {
                writer
                    .set(&format!("session:{i}"), &saved_credential(&format!("tok_{i}")))
                    .await
                    .unwrap();
            }
        });

        let get_task = tokio::spawn(async move {
            for i in 0..100 {
                if let Ok(Some(value)) = cache.get::<SavedCredential>(&format!("session:{i}")).await
                {
                    assert_eq!(value.access_token, Some(format!("tok_{i}")));
                }
            }
        });

        tokio::try_join!(set_task, get_task).unwrap();
    }
}
