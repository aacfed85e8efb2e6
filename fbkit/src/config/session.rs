use confique::Config;
use serde::Deserialize;

/// Specifies which cache store keeps the session bags
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStore {
    #[default]
    InMemory,
    Redis,
    #[serde(other)]
    None,
}

/// Configuration for server-side sessions
#[derive(Debug, Config, Clone)]
pub struct SessionConfig {
    /// Name of the cookie carrying the session id (default: fbkit_session)
    #[config(env = "FBKIT_SESSION_COOKIE", default = "fbkit_session")]
    pub cookie_name: String,

    /// Only send the session cookie over HTTPS (default: false)
    #[config(env = "FBKIT_SESSION_COOKIE_SECURE", default = false)]
    pub cookie_secure: bool,

    /// Session lifetime in seconds (default: 2 weeks)
    #[config(env = "FBKIT_SESSION_TTL", default = 1209600)]
    pub ttl: u64,

    /// Session store type: "in-memory" (default), "redis" or "none"
    #[config(env = "FBKIT_SESSION_STORE", default = "in-memory")]
    pub store: CacheStore,

    /// In-memory store specific configuration
    #[config(nested)]
    pub memory: InMemoryConfig,

    /// Redis store specific configuration
    #[config(nested)]
    pub redis: RedisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "fbkit_session".to_string(),
            cookie_secure: false,
            ttl: 1_209_600, // 2 weeks
            store: CacheStore::InMemory,
            memory: InMemoryConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// In-memory store configuration options
#[derive(Debug, Config, Clone)]
pub struct InMemoryConfig {
    /// Maximum capacity in MiB (default: 128 MiB)
    #[config(env = "FBKIT_SESSION_MEMORY_CAPACITY", default = 128)]
    pub capacity: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

/// Redis store configuration options
#[derive(Debug, Config, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection string
    #[config(env = "FBKIT_SESSION_REDIS_URL")]
    pub url: Option<String>,
}
