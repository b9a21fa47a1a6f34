use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Environment prefix for every usagetap setting, e.g. `USAGETAP_API_KEY`.
pub const ENV_PREFIX: &str = "USAGETAP";

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    /// Key handed to the collector
    pub api_key: Option<String>,
    /// Provider override; "auto" or unset means detect
    pub provider: Option<String>,
    /// Default customer for wrapped clients
    pub customer_id: Option<String>,
    pub tracking_enabled: Option<bool>,
    pub auto_detect_provider: Option<bool>,
    pub otel_exporter_otlp_endpoint: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        // The standard OTel variable is honored without the prefix
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            builder = builder.set_default("otel_exporter_otlp_endpoint", endpoint)?;
        }

        let s = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
