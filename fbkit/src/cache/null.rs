use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Session store that keeps nothing.
///
/// With this store a credential lives only as long as the request that
/// carried it, so every request must bring its own `signed_request`.
#[derive(Clone, Debug, Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        NullCache
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn set<T: Serialize + Send + Sync>(
        &self,
        _key: &str,
        _value: &T,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        _key: &str,
    ) -> Result<Option<T>, CacheError> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
