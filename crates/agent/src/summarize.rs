//! Stage summaries handed from one chain stage to the next.

use gateway::{CallRequest, GatewayExecutor};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AgentProfile, AgentsConfig, COMPRESSOR_AGENT, SummaryMode};
use crate::context::estimate_tokens;

/// JSON keys the compressor is asked for, in display order.
const SUMMARY_KEYS: [&str; 5] = [
    "key_decisions",
    "rationale",
    "trade_offs",
    "open_questions",
    "technical_specs",
];

/// Prompt for a later chain stage.
pub fn stage_prompt(original: &str, summary: &str, agent: &str) -> String {
    format!("Original request: {original}\n\n{summary}\n\nYour task as {agent}:")
}

/// Shortens `text` to about `max_chars` characters.
///
/// Prefers the last sentence boundary (`. `, `! `, `? ` or a newline) in the
/// second half of the window; otherwise cuts hard and appends `...`.
pub fn intelligent_truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(idx, _)| idx);
    let window = &text[..end];

    let boundary = [". ", "! ", "? ", "\n"]
        .iter()
        .filter_map(|pat| window.rfind(pat).map(|idx| idx + pat.trim_end().len()))
        .max();
    match boundary {
        Some(cut) if cut > 0 && cut >= window.len() / 2 => window[..cut].trim_end().to_string(),
        _ => format!("{window}..."),
    }
}

/// Condenses `text` to roughly `max_tokens` using the compressor profile.
///
/// Text already within budget is returned unchanged. A missing profile, a
/// failed call or an empty answer fall back to [`intelligent_truncate`] at
/// `max_tokens * 4` characters.
pub async fn compress_semantic(
    executor: &GatewayExecutor,
    compressor: Option<&AgentProfile>,
    text: &str,
    max_tokens: usize,
) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let fallback = || intelligent_truncate(text, max_tokens * 4);
    let Some(profile) = compressor else {
        debug!("No compressor profile, truncating");
        return fallback();
    };

    let request = CallRequest::new(profile.model.as_str(), profile.system.as_str(), text)
        .temperature(profile.temperature)
        .max_tokens(profile.max_tokens)
        .fallback_order(profile.fallback_order.clone());
    let outcome = executor.call(&request).await;
    if let Some(error) = outcome.error {
        warn!(model = %profile.model, error = %error, "Semantic compression failed, truncating");
        return fallback();
    }
    let summary = render_summary(&outcome.text);
    if summary.trim().is_empty() {
        return fallback();
    }
    summary
}

/// Renders the compressor's JSON answer as labelled lines; other text is kept as-is.
fn render_summary(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) else {
        return raw.trim().to_string();
    };

    let mut lines = Vec::new();
    for key in SUMMARY_KEYS {
        let Some(value) = map.get(key) else { continue };
        let rendered = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; "),
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        if !rendered.is_empty() {
            lines.push(format!("{key}: {rendered}"));
        }
    }
    lines.join("\n")
}

/// The summary line a finished stage contributes to the next stage's prompt.
pub async fn summarize_stage(
    executor: &GatewayExecutor,
    config: &AgentsConfig,
    agent: &str,
    response: &str,
) -> String {
    let summary = &config.summary;
    let body = match summary.mode {
        SummaryMode::Truncate => {
            let prefix: String = response.chars().take(summary.max_chars).collect();
            format!("{prefix}...")
        }
        SummaryMode::Semantic => {
            compress_semantic(
                executor,
                config.profile(COMPRESSOR_AGENT),
                response,
                summary.compress_max_tokens,
            )
            .await
        }
    };
    format!("Previous {agent} output (summarized): {body}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use gateway::{Completion, GatewayConfig, InvokeRequest, ModelInvoker, StaticCredentials};
    use parking_lot::Mutex;
    use proto::LlmError;

    use super::*;

    struct FixedInvoker {
        answers: Mutex<HashMap<String, Result<Completion, LlmError>>>,
    }

    #[async_trait]
    impl ModelInvoker for FixedInvoker {
        async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError> {
            self.answers
                .lock()
                .remove(&req.model)
                .unwrap_or_else(|| Err(LlmError::Api("no answer".into())))
        }
    }

    fn executor(answers: Vec<(&str, Result<Completion, LlmError>)>) -> GatewayExecutor {
        GatewayExecutor::new(
            Arc::new(FixedInvoker {
                answers: Mutex::new(answers.into_iter().map(|(m, r)| (m.to_string(), r)).collect()),
            }),
            Arc::new(StaticCredentials::new(["mock"])),
            GatewayConfig {
                retry_count: 0,
                retry_delay: Duration::ZERO,
            },
        )
    }

    fn compressor() -> AgentProfile {
        AgentProfile::new("mock/compressor", "compress")
    }

    #[test]
    fn truncate_prefers_sentence_boundary() {
        let text = "First sentence. Second sentence. Third sentence. Fourth sentence.";
        let result = intelligent_truncate(text, 40);
        assert!(result.len() <= 45);
        assert!(result.ends_with('.'));
        assert_eq!(result, "First sentence. Second sentence.");
    }

    #[test]
    fn truncate_without_boundary_appends_ellipsis() {
        let text = "a".repeat(100);
        let result = intelligent_truncate(&text, 50);
        assert!(result.len() <= 53);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(intelligent_truncate("short", 50), "short");
    }

    #[test]
    fn truncate_ignores_boundary_in_first_half() {
        let text = format!("Hi. {}", "b".repeat(60));
        let result = intelligent_truncate(&text, 40);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn truncate_respects_multibyte_characters() {
        let text = "가".repeat(30);
        let result = intelligent_truncate(&text, 10);
        assert_eq!(result.chars().count(), 13);
    }

    #[test]
    fn stage_prompt_layout() {
        let prompt = stage_prompt("Design an API", "Previous builder output (summarized): x...", "critic");
        assert_eq!(
            prompt,
            "Original request: Design an API\n\nPrevious builder output (summarized): x...\n\nYour task as critic:"
        );
    }

    #[tokio::test]
    async fn compress_falls_back_to_truncation_on_failure() {
        let executor = executor(vec![]);
        let text = "Word ".repeat(1000);
        let profile = compressor();
        let result = compress_semantic(&executor, Some(&profile), &text, 500).await;
        assert!(result.len() <= 2100);
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn compress_without_profile_truncates() {
        let executor = executor(vec![]);
        let text = "x".repeat(4000);
        let result = compress_semantic(&executor, None, &text, 100).await;
        assert_eq!(result.len(), 403);
    }

    #[tokio::test]
    async fn compress_returns_short_text_unchanged() {
        let executor = executor(vec![]);
        let profile = compressor();
        assert_eq!(compress_semantic(&executor, Some(&profile), "tiny", 500).await, "tiny");
    }

    #[tokio::test]
    async fn compress_renders_json_summary() {
        let json = r#"{"key_decisions": ["PostgreSQL", "Redis cache"], "rationale": "scale", "open_questions": []}"#;
        let executor = executor(vec![("mock/compressor", Ok(Completion::text(json).with_usage(50, 20)))]);
        let profile = compressor();
        let text = "Long builder output. ".repeat(200);
        let result = compress_semantic(&executor, Some(&profile), &text, 100).await;
        assert!(result.contains("key_decisions: PostgreSQL; Redis cache"));
        assert!(result.contains("rationale: scale"));
        assert!(!result.contains("open_questions"));
    }

    #[tokio::test]
    async fn truncate_mode_summary_uses_char_prefix() {
        let executor = executor(vec![]);
        let config = AgentsConfig::default();
        let response = "z".repeat(300);
        let summary = summarize_stage(&executor, &config, "builder", &response).await;
        assert_eq!(
            summary,
            format!("Previous builder output (summarized): {}...", "z".repeat(200))
        );
    }
}
