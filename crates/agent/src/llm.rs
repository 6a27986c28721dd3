//! OpenAI-compatible provider client.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, FinishReason,
    },
};
use async_trait::async_trait;
use gateway::{Completion, InvokeRequest, ModelInvoker};
use proto::LlmError;
use tracing::debug;

/// Google's OpenAI-compatible endpoint.
pub const GOOGLE_OPENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
/// OpenRouter's OpenAI-compatible endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Default local Ollama endpoint.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// OpenAI-compatible provider (works with OpenAI, Google, OpenRouter, Ollama, etc.)
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates an OpenAI provider using the default API base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
        }
    }

    /// Creates an OpenAI provider with a custom API base URL.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl ModelInvoker for OpenAiProvider {
    async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError> {
        let request = build_request(&req)?;

        debug!(
            model = %req.model,
            temperature = req.temperature,
            max_tokens = req.max_tokens,
            "Sending request to OpenAI-compatible endpoint"
        );

        let response = self.client.chat().create(request).await.map_err(|e| {
            let msg = e.to_string();
            debug!(error = %msg, "OpenAI API error");
            let lower = msg.to_lowercase();
            if lower.contains("401") || lower.contains("invalid api key") {
                LlmError::Auth(msg)
            } else if lower.contains("429") || lower.contains("rate limit") {
                LlmError::RateLimit
            } else {
                LlmError::Api(msg)
            }
        })?;

        let (prompt_tokens, completion_tokens, total_tokens) = response
            .usage
            .as_ref()
            .map_or((0, 0, 0), |u| {
                (u.prompt_tokens, u.completion_tokens, u.total_tokens)
            });
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".into()))?;

        Ok(Completion {
            text: choice.message.content,
            finish_reason: choice.finish_reason.map(finish_reason_str).map(String::from),
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

/// Builds the chat completion request for one system+user exchange.
fn build_request(req: &InvokeRequest) -> Result<CreateChatCompletionRequest, LlmError> {
    let messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(req.system.clone())
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        ),
        ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(req.user.clone())
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        ),
    ];

    CreateChatCompletionRequestArgs::default()
        .model(&req.model)
        .messages(messages)
        .temperature(req.temperature)
        .max_completion_tokens(req.max_tokens)
        .build()
        .map_err(|e| LlmError::Serialization(e.to_string()))
}

/// Maps the provider finish reason onto the gateway's string vocabulary.
fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::FunctionCall => "function_call",
    }
}
