use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use proto::LlmError;
use tracing::{debug, warn};

use crate::invoke::{Completion, InvokeRequest, ModelInvoker};
use crate::provider::{model_name, resolve_provider};

/// Routes namespaced model calls to the client registered for their provider
pub struct ProviderDispatcher {
    /// provider tag -> client
    providers: DashMap<String, Arc<dyn ModelInvoker>>,
}

impl ProviderDispatcher {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Register a client for a canonical provider tag
    pub fn register(&self, provider: impl Into<String>, client: Arc<dyn ModelInvoker>) {
        let provider = provider.into();
        debug!("Registering provider client: {provider}");
        self.providers.insert(provider, client);
    }

    /// Deregister a provider client
    pub fn deregister(&self, provider: &str) {
        debug!("Deregistering provider client: {provider}");
        self.providers.remove(provider);
    }

    pub fn is_registered(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Number of registered provider clients
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

impl Default for ProviderDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInvoker for ProviderDispatcher {
    async fn invoke(&self, mut req: InvokeRequest) -> Result<Completion, LlmError> {
        let provider = resolve_provider(&req.model);
        // Clone out of the map so no shard lock is held across the await.
        let client = self.providers.get(&provider).map(|c| Arc::clone(c.value()));
        let Some(client) = client else {
            warn!("No provider client registered for: {provider}");
            return Err(LlmError::Api(format!(
                "no provider client registered for {provider}"
            )));
        };
        req.model = model_name(&req.model).to_string();
        client.invoke(req).await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingClient {
        models: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelInvoker for RecordingClient {
        async fn invoke(&self, req: InvokeRequest) -> Result<Completion, LlmError> {
            self.models.lock().push(req.model.clone());
            Ok(Completion::text(format!("echo {}", req.model)))
        }
    }

    fn request(model: &str) -> InvokeRequest {
        InvokeRequest {
            model: model.to_string(),
            system: "sys".into(),
            user: "hi".into(),
            temperature: 0.2,
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn dispatches_by_canonical_provider_and_strips_prefix() {
        let dispatcher = ProviderDispatcher::new();
        let google = Arc::new(RecordingClient::default());
        dispatcher.register("google", google.clone());
        assert_eq!(dispatcher.provider_count(), 1);

        let completion = dispatcher
            .invoke(request("gemini/gemini-2.5-pro"))
            .await
            .expect("dispatch");
        assert_eq!(completion.text.as_deref(), Some("echo gemini-2.5-pro"));
        assert_eq!(*google.models.lock(), vec!["gemini-2.5-pro".to_string()]);
    }

    #[tokio::test]
    async fn missing_provider_is_a_plain_api_error() {
        let dispatcher = ProviderDispatcher::new();
        let err = dispatcher
            .invoke(request("openai/gpt-4o"))
            .await
            .expect_err("no client");
        assert!(matches!(err, LlmError::Api(ref m) if m.contains("openai")));
    }

    #[tokio::test]
    async fn deregister_removes_client() {
        let dispatcher = ProviderDispatcher::new();
        dispatcher.register("openai", Arc::new(RecordingClient::default()));
        assert!(dispatcher.is_registered("openai"));

        dispatcher.deregister("openai");
        assert_eq!(dispatcher.provider_count(), 0);
        assert!(dispatcher.invoke(request("openai/gpt-4o")).await.is_err());
    }
}
