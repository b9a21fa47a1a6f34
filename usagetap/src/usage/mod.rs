//! Token usage extraction
//!
//! Providers report usage in incompatible shapes. [`normalize`] tries a fixed
//! table of known shapes (see [`matchers::MATCHERS`]) and then any dot-path
//! rule configured for the provider in the [`ProviderRegistry`]. Field access
//! goes through [`Value::field`], so SDK response objects and plain JSON
//! mappings are read the same way.
//!
//! [`ProviderRegistry`]: crate::provider::ProviderRegistry

pub mod matchers;

use log::debug;
use usagetap_common::UsageRecord;

use crate::{
    object::Value,
    provider::{self, ProviderTable, ResponseConfig},
};

/// Extract usage from a response. Never fails; unknown shapes yield `None`.
pub fn normalize(response: &Value, provider: &str) -> Option<UsageRecord> {
    normalize_with(provider::provider_table(), response, provider)
}

pub fn normalize_with(
    table: &ProviderTable,
    response: &Value,
    provider: &str,
) -> Option<UsageRecord> {
    for matcher in matchers::MATCHERS {
        if let Some(record) = (matcher.extract)(response) {
            debug!("Usage for {} matched {}", provider, matcher.name);
            return Some(record);
        }
    }

    let config = table.usage_config(provider)?;
    let record = parse_configured(config, response);
    if record.is_some() {
        debug!("Usage for {} matched configured rule", provider);
    }
    record
}

/// Model name reported by the response, if any.
pub fn response_model(response: &Value, provider: &str) -> Option<String> {
    response_model_with(provider::provider_table(), response, provider)
}

pub fn response_model_with(
    table: &ProviderTable,
    response: &Value,
    provider: &str,
) -> Option<String> {
    ["model", "modelVersion", "model_version"]
        .iter()
        .find_map(|name| response.field(name)?.as_str().map(str::to_string))
        .or_else(|| {
            let config = table.usage_config(provider)?;
            response.path(&config.model_path)?.as_str().map(str::to_string)
        })
}

/// Parse usage using a configured dot-path rule
pub fn parse_configured(config: &ResponseConfig, response: &Value) -> Option<UsageRecord> {
    let usage = response.path(&config.usage_path)?;
    let input = usage.path(&config.input_tokens).and_then(|v| count(&v));
    let output = usage.path(&config.output_tokens).and_then(|v| count(&v));
    if input.is_none() && output.is_none() {
        return None;
    }
    let total = config
        .total_tokens
        .as_ref()
        .and_then(|path| usage.path(path))
        .and_then(|v| count(&v));
    Some(UsageRecord::new(
        input.unwrap_or(0),
        output.unwrap_or(0),
        total,
    ))
}

/// Coerce a token count to a non-negative integer.
///
/// Negative numbers clamp to 0, finite floats truncate and numeric strings
/// parse. Booleans, null and anything else are not counts.
pub fn count(value: &Value) -> Option<u64> {
    match value.as_data()? {
        serde_json::Value::Number(n) => {
            if let Some(n) = n.as_u64() {
                Some(n)
            } else if let Some(n) = n.as_i64() {
                Some(n.max(0) as u64)
            } else {
                n.as_f64().and_then(float_count)
            }
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                Some(n.max(0) as u64)
            } else {
                s.parse::<f64>().ok().and_then(float_count)
            }
        }
        _ => None,
    }
}

fn float_count(n: f64) -> Option<u64> {
    if !n.is_finite() {
        return None;
    }
    // `as` saturates at the u64 bounds
    Some(n.max(0.0).trunc() as u64)
}
