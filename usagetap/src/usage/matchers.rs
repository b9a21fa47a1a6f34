use usagetap_common::UsageRecord;

use super::count;
use crate::object::Value;

/// A named response shape and the function that reads usage out of it.
pub struct Matcher {
    pub name: &'static str,
    pub extract: fn(&Value) -> Option<UsageRecord>,
}

/// Built-in shapes, tried in order. The first one that matches wins.
pub static MATCHERS: &[Matcher] = &[
    Matcher {
        name: "openai_chat",
        extract: openai_chat,
    },
    Matcher {
        name: "anthropic_messages",
        extract: anthropic_messages,
    },
    Matcher {
        name: "gemini_usage_metadata",
        extract: gemini_usage_metadata,
    },
    Matcher {
        name: "cohere_v2_usage",
        extract: cohere_v2_usage,
    },
    Matcher {
        name: "cohere_meta",
        extract: cohere_meta,
    },
];

/// Read an input/output pair from `usage`. Matches when at least one side is a
/// number; the missing side counts as zero.
pub(crate) fn token_pair(
    usage: &Value,
    input: &str,
    output: &str,
    total: Option<&str>,
) -> Option<UsageRecord> {
    let input_tokens = usage.field(input).and_then(|v| count(&v));
    let output_tokens = usage.field(output).and_then(|v| count(&v));
    if input_tokens.is_none() && output_tokens.is_none() {
        return None;
    }
    let total_tokens = total
        .and_then(|name| usage.field(name))
        .and_then(|v| count(&v));
    Some(UsageRecord::new(
        input_tokens.unwrap_or(0),
        output_tokens.unwrap_or(0),
        total_tokens,
    ))
}

fn openai_chat(response: &Value) -> Option<UsageRecord> {
    let usage = response.field("usage")?;
    token_pair(&usage, "prompt_tokens", "completion_tokens", Some("total_tokens"))
}

fn anthropic_messages(response: &Value) -> Option<UsageRecord> {
    let usage = response.field("usage")?;
    token_pair(&usage, "input_tokens", "output_tokens", Some("total_tokens"))
}

fn gemini_usage_metadata(response: &Value) -> Option<UsageRecord> {
    if let Some(usage) = response.field("usage_metadata") {
        if let Some(record) = token_pair(
            &usage,
            "prompt_token_count",
            "candidates_token_count",
            Some("total_token_count"),
        ) {
            return Some(record);
        }
    }
    // REST responses spell it in camelCase
    let usage = response.field("usageMetadata")?;
    token_pair(
        &usage,
        "promptTokenCount",
        "candidatesTokenCount",
        Some("totalTokenCount"),
    )
}

fn billed_or_tokens(container: &Value) -> Option<UsageRecord> {
    container
        .field("billed_units")
        .and_then(|units| token_pair(&units, "input_tokens", "output_tokens", None))
        .or_else(|| {
            container
                .field("tokens")
                .and_then(|tokens| token_pair(&tokens, "input_tokens", "output_tokens", None))
        })
}

fn cohere_v2_usage(response: &Value) -> Option<UsageRecord> {
    billed_or_tokens(&response.field("usage")?)
}

fn cohere_meta(response: &Value) -> Option<UsageRecord> {
    billed_or_tokens(&response.field("meta")?)
}
