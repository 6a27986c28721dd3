//! Anthropic Messages API provider implementation.

use async_trait::async_trait;
use gateway::{Completion, InvokeRequest, ModelInvoker};
use proto::LlmError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ANTHROPIC_API_VERSION: &str = "2023-06-01";

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

// ── Provider ───────────────────────────────────────────────────────────────────

/// Anthropic Messages API LLM provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Creates a provider targeting the default Anthropic API endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Creates a provider targeting a custom base URL (useful for proxies/tests).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ModelInvoker for AnthropicProvider {
    async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError> {
        let anthropic_req = build_request(&req);

        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            model = %req.model,
            max_tokens = req.max_tokens,
            "Sending request to Anthropic"
        );

        let response = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&anthropic_req)
            .send()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let status = response.status();
        debug!(status = %status.as_u16(), "Anthropic response received");
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimit);
        }

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        if !status.is_success() {
            let preview: String = body.chars().take(500).collect();
            if matches!(status.as_u16(), 401 | 403) {
                return Err(LlmError::Auth(format!("HTTP {status}: {preview}")));
            }
            return Err(LlmError::Api(format!("HTTP {status}: {preview}")));
        }

        parse_response(&body)
    }
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

fn build_request(req: &InvokeRequest) -> AnthropicRequest {
    AnthropicRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        system: (!req.system.is_empty()).then(|| req.system.clone()),
        messages: vec![AnthropicMessage {
            role: "user",
            content: req.user.clone(),
        }],
    }
}

/// Parses a Messages API body into a completion.
///
/// A `refusal` stop reason is reported as `content_filter`.
fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let anthropic_resp: AnthropicResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "Deserialization error: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        ))
    })?;

    let text = anthropic_resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    let finish_reason = anthropic_resp.stop_reason.map(|reason| match reason.as_str() {
        "refusal" => "content_filter".to_string(),
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        _ => reason,
    });

    let usage = anthropic_resp.usage;
    Ok(Completion {
        text: Some(text),
        finish_reason,
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
    })
}
