//! Call-with-fallback executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proto::CallOutcome;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::failure::{CandidateFailure, FailureClass, classify_error, inspect_empty_text};
use crate::invoke::{Completion, InvokeRequest, ModelInvoker};
use crate::provider::{ModelCandidate, ProviderCredentials};

/// Retry policy applied to every candidate.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Extra attempts after the first one for retryable failures.
    pub retry_count: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_count: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// One logical model call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Models tried in order after `model` fails.
    pub fallback_order: Vec<String>,
}

impl CallRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.2,
            max_tokens: 1500,
            fallback_order: Vec::new(),
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn fallback_order(mut self, fallback_order: Vec<String>) -> Self {
        self.fallback_order = fallback_order;
        self
    }

    /// `[model] + fallback_order` as resolved candidates.
    pub fn candidates(&self) -> Vec<ModelCandidate> {
        std::iter::once(&self.model)
            .chain(self.fallback_order.iter())
            .map(|m| ModelCandidate::new(m.as_str()))
            .collect()
    }

    fn invoke_request(&self, model: &str) -> InvokeRequest {
        InvokeRequest {
            model: model.to_string(),
            system: self.system.clone(),
            user: self.user.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Runs a [`CallRequest`] over its candidate list, absorbing per-candidate failures.
pub struct GatewayExecutor {
    invoker: Arc<dyn ModelInvoker>,
    credentials: Arc<dyn ProviderCredentials>,
    config: GatewayConfig,
}

impl GatewayExecutor {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        credentials: Arc<dyn ProviderCredentials>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            invoker,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Executes the call. Never fails: total exhaustion is reported through
    /// [`CallOutcome::error`].
    pub async fn call(&self, request: &CallRequest) -> CallOutcome {
        let started = Instant::now();
        let candidates = request.candidates();
        let mut primary_failure: Option<CandidateFailure> = None;
        let mut last_failure: Option<CandidateFailure> = None;

        for (idx, candidate) in candidates.iter().enumerate() {
            match self.try_candidate(candidate, request).await {
                Ok(completion) => {
                    let mut outcome = CallOutcome {
                        total_tokens: completion.normalized_total(),
                        text: completion.text.unwrap_or_default(),
                        model: candidate.identifier.clone(),
                        provider: candidate.provider.clone(),
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                        duration_ms: elapsed_ms(started),
                        error: None,
                        original_model: None,
                        fallback_reason: None,
                    };
                    if idx > 0 {
                        outcome.original_model = Some(request.model.clone());
                        outcome.fallback_reason = Some(
                            primary_failure
                                .as_ref()
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "Primary model unavailable".to_string()),
                        );
                        info!(
                            primary = %request.model,
                            model = %candidate.identifier,
                            reason = ?outcome.fallback_reason,
                            "Fallback model answered"
                        );
                    }
                    return outcome;
                }
                Err(failure) => {
                    warn!(
                        model = %candidate.identifier,
                        provider = %candidate.provider,
                        reason = %failure,
                        "Candidate failed"
                    );
                    if idx == 0 {
                        primary_failure = Some(failure.clone());
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let primary = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| ModelCandidate::new(request.model.as_str()));
        let last = last_failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| format!("Model '{}' failed", primary.identifier));
        CallOutcome::exhausted(
            primary.identifier,
            primary.provider,
            elapsed_ms(started),
            format!("All models failed. Last error: {last}"),
        )
    }

    async fn try_candidate(
        &self,
        candidate: &ModelCandidate,
        request: &CallRequest,
    ) -> Result<Completion, CandidateFailure> {
        if !self.credentials.is_provider_enabled(&candidate.provider) {
            return Err(CandidateFailure::CredentialMissing {
                provider: candidate.provider.clone(),
            });
        }

        let attempts = self.config.retry_count.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let req = request.invoke_request(&candidate.identifier);
            match self.invoker.invoke(req).await {
                Ok(completion) => {
                    if let Some(failure) = inspect_empty_text(
                        completion.text.as_deref(),
                        completion.finish_reason.as_deref(),
                        completion.completion_tokens,
                    ) {
                        return Err(failure);
                    }
                    return Ok(completion);
                }
                Err(err) => {
                    if classify_error(&err) == FailureClass::NonRetryable {
                        return Err(CandidateFailure::AuthFailure {
                            provider: candidate.provider.clone(),
                        });
                    }
                    last_error = err.to_string();
                    if attempt < attempts {
                        debug!(
                            model = %candidate.identifier,
                            attempt,
                            error = %last_error,
                            "Retrying model call"
                        );
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(CandidateFailure::TransientFailure {
            attempts,
            message: last_error,
        })
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proto::LlmError;

    use super::*;
    use crate::provider::StaticCredentials;

    /// Scripted invoker: each model pops responses from its own queue.
    struct ScriptedInvoker {
        scripts: Mutex<HashMap<String, Vec<Result<Completion, LlmError>>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedInvoker {
        fn new(scripts: Vec<(&str, Vec<Result<Completion, LlmError>>)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(model, mut responses)| {
                            responses.reverse();
                            (model.to_string(), responses)
                        })
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelInvoker for ScriptedInvoker {
        async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(req.model.clone());
            self.scripts
                .lock()
                .get_mut(&req.model)
                .and_then(Vec::pop)
                .unwrap_or_else(|| Err(LlmError::Api("script exhausted".into())))
        }
    }

    fn executor(invoker: Arc<ScriptedInvoker>, providers: &[&str]) -> GatewayExecutor {
        GatewayExecutor::new(
            invoker,
            Arc::new(StaticCredentials::new(providers.iter().copied())),
            GatewayConfig {
                retry_count: 1,
                retry_delay: Duration::ZERO,
            },
        )
    }

    fn request(fallbacks: &[&str]) -> CallRequest {
        CallRequest::new("openai/gpt-4o", "system", "user")
            .fallback_order(fallbacks.iter().map(|m| m.to_string()).collect())
    }

    #[tokio::test]
    async fn primary_success_has_no_fallback_metadata() {
        let invoker = ScriptedInvoker::new(vec![(
            "openai/gpt-4o",
            vec![Ok(Completion::text("answer").with_usage(10, 4))],
        )]);
        let outcome = executor(invoker.clone(), &["openai"])
            .call(&request(&["anthropic/claude"]))
            .await;

        assert_eq!(outcome.text, "answer");
        assert_eq!(outcome.model, "openai/gpt-4o");
        assert_eq!(outcome.provider, "openai");
        assert_eq!(outcome.total_tokens, 14);
        assert!(outcome.error.is_none());
        assert!(!outcome.fallback_used());
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn missing_credential_skips_without_network_call() {
        let invoker = ScriptedInvoker::new(vec![(
            "anthropic/claude",
            vec![Ok(Completion::text("from fallback"))],
        )]);
        let outcome = executor(invoker.clone(), &["anthropic"])
            .call(&request(&["anthropic/claude"]))
            .await;

        assert_eq!(outcome.text, "from fallback");
        assert_eq!(outcome.original_model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(
            outcome.fallback_reason.as_deref(),
            Some("missing credential for provider openai")
        );
        assert_eq!(*invoker.seen.lock(), vec!["anthropic/claude".to_string()]);
    }

    #[tokio::test]
    async fn fallback_reason_is_primary_failure_not_latest() {
        let invoker = ScriptedInvoker::new(vec![
            (
                "openai/gpt-4o",
                vec![Err(LlmError::Api("401 Unauthorized".into()))],
            ),
            ("gemini/gemini-2.5-pro", vec![Ok(Completion::text(""))]),
            ("anthropic/claude", vec![Ok(Completion::text("third time lucky"))]),
        ]);
        let outcome = executor(invoker, &["openai", "google", "anthropic"])
            .call(&request(&["gemini/gemini-2.5-pro", "anthropic/claude"]))
            .await;

        assert_eq!(outcome.text, "third time lucky");
        assert_eq!(outcome.model, "anthropic/claude");
        assert_eq!(
            outcome.fallback_reason.as_deref(),
            Some("authentication failed for provider openai")
        );
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let invoker = ScriptedInvoker::new(vec![(
            "openai/gpt-4o",
            vec![
                Err(LlmError::Auth("invalid key".into())),
                Ok(Completion::text("should not be reached")),
            ],
        )]);
        let outcome = executor(invoker.clone(), &["openai"]).call(&request(&[])).await;

        assert!(outcome.is_error());
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let invoker = ScriptedInvoker::new(vec![(
            "openai/gpt-4o",
            vec![
                Err(LlmError::Api("connection reset".into())),
                Ok(Completion::text("recovered")),
            ],
        )]);
        let outcome = executor(invoker.clone(), &["openai"]).call(&request(&[])).await;

        assert_eq!(outcome.text, "recovered");
        assert!(!outcome.fallback_used());
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test]
    async fn maximal_retry_count_does_not_overflow() {
        let invoker = ScriptedInvoker::new(vec![(
            "openai/gpt-4o",
            vec![Err(LlmError::Api("blip".into())), Ok(Completion::text("ok"))],
        )]);
        let executor = GatewayExecutor::new(
            invoker.clone(),
            Arc::new(StaticCredentials::new(["openai"])),
            GatewayConfig {
                retry_count: u32::MAX,
                retry_delay: Duration::ZERO,
            },
        );
        let outcome = executor.call(&request(&[])).await;

        assert_eq!(outcome.text, "ok");
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test]
    async fn transient_failure_exhausts_attempt_budget() {
        let invoker = ScriptedInvoker::new(vec![(
            "openai/gpt-4o",
            vec![
                Err(LlmError::Api("timeout".into())),
                Err(LlmError::Api("timeout again".into())),
            ],
        )]);
        let outcome = executor(invoker.clone(), &["openai"]).call(&request(&[])).await;

        let error = outcome.error.expect("error");
        assert!(error.starts_with("All models failed. Last error:"));
        assert!(error.contains("after 2 attempts"));
        assert!(error.contains("timeout again"));
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test]
    async fn content_filtered_response_triggers_fallback() {
        let invoker = ScriptedInvoker::new(vec![
            (
                "openai/gpt-4o",
                vec![Ok(Completion {
                    text: None,
                    finish_reason: Some("content_filter".into()),
                    prompt_tokens: 20,
                    completion_tokens: 0,
                    total_tokens: 20,
                })],
            ),
            ("anthropic/claude", vec![Ok(Completion::text("safe answer"))]),
        ]);
        let outcome = executor(invoker.clone(), &["openai", "anthropic"])
            .call(&request(&["anthropic/claude"]))
            .await;

        assert_eq!(outcome.text, "safe answer");
        assert!(
            outcome
                .fallback_reason
                .as_deref()
                .is_some_and(|r| r.contains("content filtered"))
        );
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test]
    async fn all_candidates_failing_returns_zeroed_error_outcome() {
        let invoker = ScriptedInvoker::new(vec![(
            "anthropic/claude",
            vec![Ok(Completion {
                text: Some(String::new()),
                finish_reason: Some("stop".into()),
                prompt_tokens: 30,
                completion_tokens: 15,
                total_tokens: 45,
            })],
        )]);
        let outcome = executor(invoker, &["anthropic"])
            .call(&request(&["anthropic/claude"]))
            .await;

        assert!(outcome.text.is_empty());
        assert_eq!(outcome.model, "openai/gpt-4o");
        assert_eq!(outcome.provider, "openai");
        assert_eq!(outcome.prompt_tokens, 0);
        assert_eq!(outcome.completion_tokens, 0);
        assert_eq!(outcome.total_tokens, 0);
        assert!(outcome.original_model.is_none());
        let error = outcome.error.expect("error");
        assert!(error.contains("empty response despite 15 completion tokens"));
    }

    #[tokio::test]
    async fn candidates_keep_primary_first() {
        let req = request(&["gemini/gemini-2.5-pro", "anthropic/claude"]);
        let providers: Vec<String> = req.candidates().into_iter().map(|c| c.provider).collect();
        assert_eq!(providers, vec!["openai", "google", "anthropic"]);
    }
}
