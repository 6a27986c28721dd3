//! Prompt → agent role classification.

use gateway::{CallRequest, GatewayExecutor};
use proto::AgentRole;
use tracing::{debug, warn};

use crate::config::AgentsConfig;

/// Parses a router answer. Only an exact role name (after trimming and
/// case-folding) is accepted.
pub fn parse_route(answer: &str) -> Option<AgentRole> {
    answer.trim().to_lowercase().parse().ok()
}

/// Picks the role for `prompt`, defaulting to [`AgentRole::Builder`] when no
/// router is configured, the call fails, or the answer is not a role name.
pub async fn route(executor: &GatewayExecutor, config: &AgentsConfig, prompt: &str) -> AgentRole {
    let Some(router) = config.router() else {
        debug!("No router profile, defaulting to builder");
        return AgentRole::Builder;
    };

    let request = CallRequest::new(router.model.as_str(), router.system.as_str(), prompt)
        .temperature(router.temperature)
        .max_tokens(router.max_tokens)
        .fallback_order(router.fallback_order.clone());
    let outcome = executor.call(&request).await;
    if let Some(error) = outcome.error {
        warn!(error = %error, "Routing failed, defaulting to builder");
        return AgentRole::Builder;
    }

    match parse_route(&outcome.text) {
        Some(role) => {
            debug!(role = %role, model = %outcome.model, "Prompt routed");
            role
        }
        None => {
            warn!(answer = %outcome.text, "Unrecognised routing answer, defaulting to builder");
            AgentRole::Builder
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use gateway::{Completion, GatewayConfig, InvokeRequest, ModelInvoker, StaticCredentials};
    use proto::LlmError;

    use super::*;
    use crate::config::{AgentProfile, ROUTER_AGENT};

    struct Answer(Result<&'static str, &'static str>);

    #[async_trait]
    impl ModelInvoker for Answer {
        async fn invoke(&self, _req: InvokeRequest) -> Result<Completion, LlmError> {
            match self.0 {
                Ok(text) => Ok(Completion::text(text).with_usage(5, 1)),
                Err(e) => Err(LlmError::Api(e.to_string())),
            }
        }
    }

    fn setup(answer: Result<&'static str, &'static str>) -> (GatewayExecutor, AgentsConfig) {
        let executor = GatewayExecutor::new(
            Arc::new(Answer(answer)),
            Arc::new(StaticCredentials::new(["mock"])),
            GatewayConfig {
                retry_count: 0,
                retry_delay: Duration::ZERO,
            },
        );
        let mut config = AgentsConfig::default();
        config.agents.insert(
            ROUTER_AGENT.to_string(),
            AgentProfile::new("mock/router", "classify").with_sampling(0.1, 10),
        );
        (executor, config)
    }

    #[test]
    fn parse_accepts_exact_names_only() {
        assert_eq!(parse_route("critic"), Some(AgentRole::Critic));
        assert_eq!(parse_route("  CLOSER\n"), Some(AgentRole::Closer));
        assert_eq!(parse_route("critic."), None);
        assert_eq!(parse_route("the builder"), None);
        assert_eq!(parse_route(""), None);
    }

    #[tokio::test]
    async fn routes_to_answered_role() {
        let (executor, config) = setup(Ok("Critic"));
        assert_eq!(route(&executor, &config, "review this").await, AgentRole::Critic);
    }

    #[tokio::test]
    async fn garbage_answer_defaults_to_builder() {
        let (executor, config) = setup(Ok("I think this is a review task"));
        assert_eq!(route(&executor, &config, "review this").await, AgentRole::Builder);
    }

    #[tokio::test]
    async fn failed_call_defaults_to_builder() {
        let (executor, config) = setup(Err("connection reset"));
        assert_eq!(route(&executor, &config, "summarize").await, AgentRole::Builder);
    }

    #[tokio::test]
    async fn missing_router_defaults_to_builder() {
        let (executor, mut config) = setup(Ok("closer"));
        config.agents.remove(ROUTER_AGENT);
        assert_eq!(route(&executor, &config, "finalize").await, AgentRole::Builder);
    }
}
