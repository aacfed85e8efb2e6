pub use crate::config::session::{CacheStore, InMemoryConfig, RedisConfig, SessionConfig};
use confique::Config;

pub mod session;

/// Application credentials, endpoints and session settings.
///
/// Built once at start-up and shared by reference with every request.
#[derive(Debug, Config, Clone)]
pub struct FacebookConfig {
    /// Application id (client_id) as registered with Facebook
    #[config(env = "FACEBOOK_APP_ID", default = "")]
    pub app_id: String,

    /// Application secret used to sign and verify payloads - mandatory
    #[config(env = "FACEBOOK_APP_SECRET")]
    pub app_secret: String,

    /// Canvas application name, used to build apps.facebook.com URLs
    #[config(env = "FACEBOOK_APP_NAME")]
    pub app_name: Option<String>,

    /// Canvas URL the application is served from behind Facebook
    #[config(env = "FACEBOOK_CANVAS_URL")]
    pub canvas_url: Option<String>,

    /// Where unauthorized users are sent (default: /facebook/auth/)
    #[config(env = "FACEBOOK_AUTH_URL", default = "/facebook/auth/")]
    pub auth_url: String,

    /// Default extended permissions required by protected views
    /// Comma-separated list (default: none)
    #[config(env = "FACEBOOK_PERMS", default = "")]
    pub perms: String,

    /// Graph API base URL (default: https://graph.facebook.com)
    #[config(env = "FACEBOOK_GRAPH_URL", default = "https://graph.facebook.com")]
    pub graph_url: String,

    /// REST API base URL (default: https://api.facebook.com)
    #[config(env = "FACEBOOK_API_URL", default = "https://api.facebook.com")]
    pub api_url: String,

    /// Canvas applications base URL (default: http://apps.facebook.com)
    #[config(env = "FACEBOOK_APPS_URL", default = "http://apps.facebook.com")]
    pub apps_url: String,

    /// Optional HTTP proxy for all remote API calls
    #[config(env = "FACEBOOK_HTTP_PROXY")]
    pub http_proxy: Option<String>,

    /// Timeout for remote API calls in seconds (default: 10)
    #[config(env = "FACEBOOK_REQUEST_TIMEOUT", default = 10)]
    pub request_timeout: u64,

    /// Largest urlencoded POST body inspected for a signed payload, in bytes
    /// (default: 1 MiB). Larger bodies reach the handler untouched.
    #[config(env = "FACEBOOK_MAX_FORM_BYTES", default = 1048576)]
    pub max_form_bytes: usize,

    /// Server-side session settings
    #[config(nested)]
    pub session: SessionConfig,
}

impl FacebookConfig {
    /// Creates a new configuration from environment variables
    pub fn new() -> Result<Self, confique::Error> {
        Self::builder().env().load()
    }

    /// Default required permissions as a list
    pub fn default_permissions(&self) -> Vec<String> {
        self.perms
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    #[cfg(test)]
    pub fn for_test_with_mocks(facebook_mock: &wiremock::MockServer) -> Self {
        Self {
            app_id: "249784291698385".to_string(),
            app_secret: "1ab476e5962c119b61a819e692feff77".to_string(),
            app_name: None,
            canvas_url: None,
            auth_url: "/facebook/auth/".to_string(),
            perms: String::new(),
            // Both API hosts are served by the same mock
            graph_url: facebook_mock.uri(),
            api_url: facebook_mock.uri(),
            apps_url: "http://apps.facebook.com".to_string(),
            http_proxy: None,
            request_timeout: 5,
            max_form_bytes: 1024 * 1024,
            session: SessionConfig::default(),
        }
    }
}
