//! Data shared between the usagetap interception core and the collectors that
//! deliver its events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value metadata attached to a usage event.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Token counts extracted from a single provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageRecord {
    /// Build a record. A provider-reported total wins over the computed sum.
    pub fn new(input_tokens: u64, output_tokens: u64, reported_total: Option<u64>) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: reported_total
                .unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

/// One intercepted invocation, as handed to a reporting sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub customer_id: Option<String>,
    pub provider: String,
    pub model: Option<String>,
    /// Dotted path of the intercepted method, e.g. `chat.completions.create`.
    pub method: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub error_occurred: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn usage(&self) -> UsageRecord {
        UsageRecord {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_defaults_to_sum() {
        let record = UsageRecord::new(10, 20, None);
        assert_eq!(record.total_tokens, 30);
    }

    #[test]
    fn test_reported_total_wins() {
        let record = UsageRecord::new(10, 20, Some(42));
        assert_eq!(record.total_tokens, 42);
    }

    #[test]
    fn test_is_empty() {
        assert!(UsageRecord::default().is_empty());
        assert!(!UsageRecord::new(0, 1, None).is_empty());
        assert!(!UsageRecord::new(0, 0, Some(3)).is_empty());
    }

    #[test]
    fn test_sum_saturates() {
        let record = UsageRecord::new(u64::MAX, 1, None);
        assert_eq!(record.total_tokens, u64::MAX);
    }

    #[test]
    fn test_event_serializes_with_snake_case_fields() {
        let event = UsageEvent {
            customer_id: Some("customer-123".to_string()),
            provider: "openai".to_string(),
            model: Some("gpt-4".to_string()),
            method: "chat.completions.create".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            metadata: Metadata::new(),
            error_occurred: false,
            error_type: None,
            error_message: None,
            latency_ms: 12,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["customer_id"], "customer-123");
        assert_eq!(json["total_tokens"], 30);
        assert_eq!(json["error_occurred"], false);
        assert_eq!(event.usage(), UsageRecord::new(10, 20, None));
    }
}
