use log::warn;
use regex::Regex;
use serde::Deserialize;

/// Dot-path rules for reading usage out of a provider's responses
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResponseConfig {
    /// Path to the usage object (e.g., "usage" or "meta.billed_units")
    #[serde(default = "default_usage_path")]
    pub usage_path: String,

    /// Field for input/prompt tokens within the usage object
    #[serde(default = "default_input_tokens")]
    pub input_tokens: String,

    /// Field for output/completion tokens within the usage object
    #[serde(default = "default_output_tokens")]
    pub output_tokens: String,

    /// Optional: field holding a provider-reported total
    pub total_tokens: Option<String>,

    /// Path to the model name, from the response root
    #[serde(default = "default_model_path")]
    pub model_path: String,
}

fn default_usage_path() -> String {
    "usage".to_string()
}
fn default_input_tokens() -> String {
    "input_tokens".to_string()
}
fn default_output_tokens() -> String {
    "output_tokens".to_string()
}
fn default_model_path() -> String {
    "model".to_string()
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            usage_path: default_usage_path(),
            input_tokens: default_input_tokens(),
            output_tokens: default_output_tokens(),
            total_tokens: None,
            model_path: default_model_path(),
        }
    }
}

/// A detection rule for one provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRule {
    /// Provider tag reported on usage events
    pub name: String,

    /// Regex matched against the client's origin (module path)
    pub pattern: String,

    /// Extra usage extraction for responses this provider returns
    #[serde(default)]
    pub usage: Option<ResponseConfig>,
}

impl ProviderRule {
    fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            usage: None,
        }
    }
}

/// Ordered provider rules; the first matching rule wins
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderRule>,
}

impl ProviderRegistry {
    /// Load from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(yaml)
    }

    /// Built-in rules for the providers recognized out of the box
    pub fn with_defaults() -> Self {
        Self {
            providers: vec![
                ProviderRule::new("openai", "^openai"),
                ProviderRule::new("anthropic", "anthropic"),
                ProviderRule::new("google", "google"),
                ProviderRule::new("cohere", "cohere"),
                ProviderRule::new("huggingface", "huggingface"),
            ],
        }
    }

    /// Custom rules first, then the built-in defaults
    pub fn with_custom(custom: ProviderRegistry) -> Self {
        let mut providers = custom.providers;
        providers.extend(Self::with_defaults().providers);
        Self { providers }
    }

    /// Compile the patterns. Rules with an invalid regex are skipped.
    pub fn compile(&self) -> ProviderTable {
        let rules = self
            .providers
            .iter()
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(regex) => Some((regex, rule.clone())),
                Err(e) => {
                    warn!(
                        "Skipping provider rule '{}': invalid pattern '{}': {}",
                        rule.name, rule.pattern, e
                    );
                    None
                }
            })
            .collect();
        ProviderTable { rules }
    }
}

/// Compiled form of a [`ProviderRegistry`]
#[derive(Debug, Clone)]
pub struct ProviderTable {
    rules: Vec<(Regex, ProviderRule)>,
}

impl ProviderTable {
    /// Find the first rule whose pattern matches `identity`
    pub fn find_provider(&self, identity: &str) -> Option<&ProviderRule> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(identity))
            .map(|(_, rule)| rule)
    }

    /// Usage rule configured for a provider tag, if any
    pub fn usage_config(&self, provider: &str) -> Option<&ResponseConfig> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.name == provider && rule.usage.is_some())
            .and_then(|(_, rule)| rule.usage.as_ref())
    }
}
