use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use log::error;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

/// Session store shared by every process pointing at the same Redis.
/// Each write refreshes the key's TTL.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    ttl_secs: u64,
}

impl RedisCache {
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, String> {
        let client = Client::open(redis_url)
            .map_err(|err| format!("Invalid Redis URL for session store: {}", err))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|err| format!("Failed to connect session store to Redis: {}", err))?;

        let store = Self {
            conn_manager,
            ttl_secs,
        };
        store.health_check().await?;
        Ok(store)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.conn_manager.clone();

        conn.set_ex::<_, _, ()>(key, serialized, self.ttl_secs)
            .await
            .map_err(|err| {
                error!("Redis error while saving session {}: {}", key, err);
                CacheError::Redis(err.to_string())
            })
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn_manager.clone();

        let result: Option<String> = match conn.get(key).await {
            Ok(value) => value,
            Err(err) if err.kind() == redis::ErrorKind::TypeError => return Ok(None),
            Err(err) => {
                error!("Redis error while loading session {}: {}", key, err);
                return Err(CacheError::Redis(err.to_string()));
            }
        };

        match result {
            Some(value) => serde_json::from_str(&value)
                .map_err(|e| CacheError::Deserialization(e.to_string()))
                .map(Some),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| format!("Redis health check failed: {}", err))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();

        conn.del::<_, ()>(key).await.map_err(|err| {
            error!("Redis error while deleting session {}: {}", key, err);
            CacheError::Redis(err.to_string())
        })
    }
}
