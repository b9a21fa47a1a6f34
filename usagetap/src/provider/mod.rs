//! Provider detection
//!
//! Providers are recognized from the wrapped client's origin by an ordered,
//! configurable rule table. Custom rules can be supplied as YAML or JSON:
//!
//! ```yaml
//! providers:
//!   - name: bedrock
//!     pattern: "boto3|bedrock"
//!     usage:
//!       usage_path: "usage"
//!       input_tokens: "inputTokens"
//!       output_tokens: "outputTokens"
//!       total_tokens: "totalTokens"
//! ```
//!
//! Custom rules are tried before the built-in ones.

mod config;

use log::{info, warn};
use once_cell::sync::Lazy;

pub use config::{ProviderRegistry, ProviderRule, ProviderTable, ResponseConfig};

use crate::object::Object;

/// Tag reported when the provider cannot be determined.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Explicit provider value that asks for detection.
pub const AUTO_PROVIDER: &str = "auto";

pub const PROVIDERS_CONFIG_FILE_ENV: &str = "USAGETAP_PROVIDERS_CONFIG_FILE";
pub const PROVIDERS_CONFIG_ENV: &str = "USAGETAP_PROVIDERS_CONFIG";

/// Compiled rule table, built once on first use
static PROVIDER_TABLE: Lazy<ProviderTable> = Lazy::new(|| load_provider_registry().compile());

pub fn provider_table() -> &'static ProviderTable {
    &PROVIDER_TABLE
}

/// Build the registry from the environment, falling back to the defaults.
pub fn load_provider_registry() -> ProviderRegistry {
    // 1. Try loading from config file
    if let Ok(path) = std::env::var(PROVIDERS_CONFIG_FILE_ENV) {
        match std::fs::read_to_string(&path) {
            Ok(content) => match ProviderRegistry::from_yaml(&content) {
                Ok(custom) => {
                    info!("Loaded provider rules from: {}", path);
                    return ProviderRegistry::with_custom(custom);
                }
                Err(e) => warn!("Failed to parse provider config {}: {}", path, e),
            },
            Err(e) => warn!("Failed to read provider config {}: {}", path, e),
        }
    }

    // 2. Try inline JSON
    if let Ok(config) = std::env::var(PROVIDERS_CONFIG_ENV) {
        if !config.is_empty() {
            match ProviderRegistry::from_json(&config) {
                Ok(custom) => return ProviderRegistry::with_custom(custom),
                Err(e) => warn!("Failed to parse {}: {}", PROVIDERS_CONFIG_ENV, e),
            }
        }
    }

    // 3. Use defaults
    ProviderRegistry::with_defaults()
}

/// Resolve the provider tag for a client.
pub fn detect_provider(client: &dyn Object, explicit: Option<&str>, auto_detect: bool) -> String {
    detect_provider_with(provider_table(), client, explicit, auto_detect)
}

pub fn detect_provider_with(
    table: &ProviderTable,
    client: &dyn Object,
    explicit: Option<&str>,
    auto_detect: bool,
) -> String {
    if let Some(provider) = explicit.filter(|p| *p != AUTO_PROVIDER) {
        return provider.to_string();
    }
    if !auto_detect {
        return UNKNOWN_PROVIDER.to_string();
    }

    match client.origin().filter(|origin| !origin.is_empty()) {
        Some(origin) => provider_for_origin(table, origin),
        None => provider_for_type(table, client.type_name()),
    }
}

/// Provider tag for a module path. Unmatched paths report their top-level
/// segment, so `mycorp.llm` becomes `mycorp`.
pub fn provider_for_origin(table: &ProviderTable, origin: &str) -> String {
    let origin = origin.to_lowercase();
    if let Some(rule) = table.find_provider(&origin) {
        return rule.name.clone();
    }
    match origin.split('.').next() {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => UNKNOWN_PROVIDER.to_string(),
    }
}

fn provider_for_type(table: &ProviderTable, type_name: &str) -> String {
    table
        .find_provider(&type_name.to_lowercase())
        .map(|rule| rule.name.clone())
        .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string())
}
