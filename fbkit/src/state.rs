use crate::cache::{create_cache, Cache};
use crate::client::Facebook;
use crate::config::FacebookConfig;
use crate::session::SessionStore;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// State shared by the fbkit middleware, gate and auth endpoint
#[derive(Clone)]
pub struct FacebookState {
    pub config: Arc<FacebookConfig>,
    pub sessions: SessionStore,
    pub http: Client,
}

impl FacebookState {
    fn create_http_client(config: &FacebookConfig) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .connect_timeout(Duration::from_secs(config.request_timeout.min(5)))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        if let Some(proxy) = config.http_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        builder.build()
    }

    /// Build the state with the session store selected by the configuration
    pub async fn new(config: FacebookConfig) -> Result<Self, std::io::Error> {
        let cache = create_cache(&config.session)
            .await
            .map_err(|e| std::io::Error::other(format!("Failed to create session store: {}", e)))?;
        Self::with_cache(config, cache)
    }

    /// Build the state around an existing session store
    pub fn with_cache(config: FacebookConfig, cache: Cache) -> Result<Self, std::io::Error> {
        let http = Self::create_http_client(&config)
            .map_err(|e| std::io::Error::other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            config: Arc::new(config),
            sessions: SessionStore::new(Arc::new(cache)),
            http,
        })
    }

    /// Fresh client for one request, with an empty credential
    pub fn facebook(&self) -> Facebook {
        Facebook::new(self.config.clone(), self.http.clone())
    }

    pub async fn health_check(&self) -> bool {
        match self.sessions.health_check().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Session store is unhealthy: {}", e);
                false
            }
        }
    }
}
