use confique::Config;
use fbkit::FacebookConfig;

/// Settings of the sample canvas application
#[derive(Debug, Config, Clone)]
pub struct SampleConfig {
    /// Port to listen on (default: 8000)
    #[config(env = "FBSAMPLE_PORT", default = 8000)]
    pub port: u16,

    /// Facebook application settings
    #[config(nested)]
    pub facebook: FacebookConfig,
}

impl SampleConfig {
    /// Creates a new configuration from environment variables
    pub fn new() -> Result<Self, confique::Error> {
        Self::builder().env().load()
    }
}
