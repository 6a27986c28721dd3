use serde::{Deserialize, Serialize};

/// Result of one logical model call, after fallback resolution.
///
/// `original_model`/`fallback_reason` are only set when a non-primary
/// candidate produced the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Generated text; empty when `error` is set.
    pub text: String,
    /// Model that produced the text (the primary model on total failure).
    pub model: String,
    /// Canonical provider tag for `model`.
    pub provider: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Wall time across every attempted candidate.
    pub duration_ms: f64,
    /// Summary of the last failure when every candidate failed.
    pub error: Option<String>,
    /// Primary model, present only when a fallback answered.
    pub original_model: Option<String>,
    /// Failure reason of the primary model, present only when a fallback answered.
    pub fallback_reason: Option<String>,
}

impl CallOutcome {
    /// Builds the error-bearing outcome returned when every candidate failed.
    pub fn exhausted(
        model: impl Into<String>,
        provider: impl Into<String>,
        duration_ms: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            text: String::new(),
            model: model.into(),
            provider: provider.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            duration_ms,
            error: Some(error.into()),
            original_model: None,
            fallback_reason: None,
        }
    }

    /// Whether a fallback candidate produced this outcome.
    pub fn fallback_used(&self) -> bool {
        self.original_model.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Record of a single agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub response: String,
    pub duration_ms: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// UTC timestamp (RFC 3339) taken after the call returned.
    pub timestamp: String,
    /// File name reported by the run log sink; empty when nothing was written.
    pub log_file: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub fallback_used: bool,
}

impl RunRecord {
    /// Builds a record for `agent` from a finished call.
    pub fn from_outcome(
        agent: impl Into<String>,
        prompt: impl Into<String>,
        outcome: CallOutcome,
        timestamp: impl Into<String>,
    ) -> Self {
        let fallback_used = outcome.fallback_used();
        Self {
            agent: agent.into(),
            model: outcome.model,
            provider: outcome.provider,
            prompt: prompt.into(),
            response: outcome.text,
            duration_ms: outcome.duration_ms,
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            total_tokens: outcome.total_tokens,
            timestamp: timestamp.into(),
            log_file: String::new(),
            error: outcome.error,
            original_model: outcome.original_model,
            fallback_reason: outcome.fallback_reason,
            fallback_used,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(original: Option<&str>) -> CallOutcome {
        CallOutcome {
            text: "hello".to_string(),
            model: "anthropic/claude-sonnet".to_string(),
            provider: "anthropic".to_string(),
            prompt_tokens: 12,
            completion_tokens: 3,
            total_tokens: 15,
            duration_ms: 42.0,
            error: None,
            original_model: original.map(str::to_string),
            fallback_reason: original.map(|_| "missing credential for provider openai".to_string()),
        }
    }

    #[test]
    fn exhausted_outcome_has_zero_tokens_and_error() {
        let outcome = CallOutcome::exhausted("openai/gpt-4o", "openai", 7.5, "All models failed");
        assert!(outcome.is_error());
        assert!(outcome.text.is_empty());
        assert_eq!(outcome.prompt_tokens, 0);
        assert_eq!(outcome.completion_tokens, 0);
        assert_eq!(outcome.total_tokens, 0);
        assert_eq!(outcome.duration_ms, 7.5);
        assert!(!outcome.fallback_used());
    }

    #[test]
    fn run_record_copies_fallback_metadata() {
        let record = RunRecord::from_outcome(
            "builder",
            "prompt",
            success(Some("openai/gpt-4o")),
            "2026-01-01T00:00:00Z",
        );
        assert!(record.fallback_used);
        assert_eq!(record.original_model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(record.response, "hello");
        assert_eq!(record.total_tokens, 15);
        assert!(record.log_file.is_empty());
    }

    #[test]
    fn run_record_without_fallback_omits_optional_fields() {
        let record = RunRecord::from_outcome("critic", "p", success(None), "t");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["fallback_used"], false);
        assert!(json.get("original_model").is_none());
        assert!(json.get("fallback_reason").is_none());
        assert!(json["error"].is_null());
    }
}
