//! Model invocation capability used by the executor.

use async_trait::async_trait;
use proto::LlmError;

/// A single-turn completion request against one concrete model.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Model identifier, `<provider-prefix>/<model-name>` when routed through the dispatcher.
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Raw provider answer, before content inspection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Generated text; `None` when the provider returned no content at all.
    pub text: Option<String>,
    /// Provider stop/finish reason (`stop`, `length`, `content_filter`, ...).
    pub finish_reason: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Completion {
    /// Completion carrying `text` with a `stop` finish reason.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            finish_reason: Some("stop".to_string()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self.total_tokens = prompt_tokens + completion_tokens;
        self
    }

    /// Token total, derived from the parts when the provider left it at zero.
    pub fn normalized_total(&self) -> u32 {
        if self.total_tokens == 0 {
            self.prompt_tokens + self.completion_tokens
        } else {
            self.total_tokens
        }
    }
}

/// Capability to run one model call.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Sends the request and returns the provider's raw completion.
    async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError>;
}
