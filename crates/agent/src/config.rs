//! Orchestration configuration: agent profiles, refinement, multi-critic
//! consensus, dynamic critic selection, context retrieval and pricing.

use std::collections::BTreeMap;

use proto::{AgentRole, ConfigError};
use serde::{Deserialize, Serialize};

use crate::context::ContextStrategy;

/// Name of the routing profile.
pub const ROUTER_AGENT: &str = "router";
/// Name of the optional stage-summary profile.
pub const COMPRESSOR_AGENT: &str = "compressor";

/// Model settings for one named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// `<provider-prefix>/<model-name>`.
    pub model: String,
    #[serde(default)]
    pub system: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1500
}

impl AgentProfile {
    pub fn new(model: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            fallback_order: Vec::new(),
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: &[&str]) -> Self {
        self.fallback_order = fallbacks.iter().map(|m| m.to_string()).collect();
        self
    }
}

/// Builder → critic → refine loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub max_iterations: u32,
    /// Fewer keyword hits than this means "no critical issues".
    pub min_critical_issues: usize,
    /// Matched case-insensitively per critique line.
    pub critical_keywords: Vec<String>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
            min_critical_issues: 1,
            critical_keywords: ["CRITICAL", "ERROR", "SECURITY", "INCORRECT", "VULNERABILITY", "BROKEN"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Critics that must flag the same finding for it to be listed as shared.
    pub threshold: usize,
    /// Critic name → weight. Weight above 1.0 marks a high-priority critic.
    pub weights: BTreeMap<String, f32>,
}

impl ConsensusConfig {
    /// Configured weight, 1.0 when absent.
    pub fn weight(&self, critic: &str) -> f32 {
        self.weights.get(critic).copied().unwrap_or(1.0)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            weights: BTreeMap::from([
                ("security-critic".to_string(), 1.5),
                ("performance-critic".to_string(), 1.0),
                ("code-quality-critic".to_string(), 0.8),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiCriticConfig {
    pub enabled: bool,
    pub critics: Vec<String>,
    pub consensus: ConsensusConfig,
    pub parallel_execution: bool,
}

impl Default for MultiCriticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            critics: vec![
                "security-critic".to_string(),
                "performance-critic".to_string(),
                "code-quality-critic".to_string(),
            ],
            consensus: ConsensusConfig::default(),
            parallel_execution: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicSelectionConfig {
    pub enabled: bool,
    /// Only `keyword` is understood.
    pub mode: String,
    pub min_critics: usize,
    pub max_critics: usize,
    /// Critic name → trigger words.
    pub keywords: BTreeMap<String, Vec<String>>,
    /// Used when no critic scores above zero.
    pub fallback_critics: Vec<String>,
}

impl Default for DynamicSelectionConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            enabled: false,
            mode: "keyword".to_string(),
            min_critics: 1,
            max_critics: 3,
            keywords: BTreeMap::from([
                (
                    "security-critic".to_string(),
                    words(&["auth", "password", "token", "encrypt", "injection", "secret", "permission", "jwt"]),
                ),
                (
                    "performance-critic".to_string(),
                    words(&["performance", "latency", "cache", "query", "index", "scale", "memory", "throughput"]),
                ),
                (
                    "code-quality-critic".to_string(),
                    words(&["refactor", "test", "readability", "function", "class", "module", "design", "maintain"]),
                ),
            ]),
            fallback_critics: vec!["code-quality-critic".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub strategy: ContextStrategy,
    pub max_tokens: usize,
    pub min_relevance: f32,
    /// Hybrid blend: `semantic_weight * semantic + (1 - semantic_weight) * keyword`.
    pub semantic_weight: f32,
    /// How many recent conversations semantic ranking considers.
    pub semantic_pool: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Keyword,
            max_tokens: 500,
            min_relevance: 0.3,
            semantic_weight: 0.7,
            semantic_pool: 50,
        }
    }
}

/// How a finished stage is condensed for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SummaryMode {
    /// First `max_chars` characters followed by `...`.
    #[default]
    Truncate,
    /// Structured summary from the `compressor` agent.
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub mode: SummaryMode,
    pub max_chars: usize,
    /// Token budget handed to the compressor.
    pub compress_max_tokens: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            mode: SummaryMode::Truncate,
            max_chars: 200,
            compress_max_tokens: 500,
        }
    }
}

/// Per-conversation persistence policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    /// Embed each stored exchange immediately instead of lazily.
    pub generate_embeddings: bool,
}

/// USD per 1000 tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        f64::from(prompt_tokens) / 1000.0 * self.input_per_1k
            + f64::from(completion_tokens) / 1000.0 * self.output_per_1k
    }
}

/// Everything the runtime reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub agents: BTreeMap<String, AgentProfile>,
    pub refinement: RefinementConfig,
    pub multi_critic: MultiCriticConfig,
    pub dynamic_selection: DynamicSelectionConfig,
    pub context: ContextConfig,
    pub summary: SummaryConfig,
    pub memory: MemoryPolicy,
    /// Model id → price.
    pub pricing: BTreeMap<String, ModelPricing>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            refinement: RefinementConfig::default(),
            multi_critic: MultiCriticConfig::default(),
            dynamic_selection: DynamicSelectionConfig::default(),
            context: ContextConfig::default(),
            summary: SummaryConfig::default(),
            memory: MemoryPolicy::default(),
            pricing: BTreeMap::new(),
        }
    }
}

impl AgentsConfig {
    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name)
    }

    pub fn router(&self) -> Option<&AgentProfile> {
        self.profile(ROUTER_AGENT)
    }

    /// Cost of a call, 0.0 when the model has no price entry.
    pub fn cost_for(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.pricing
            .get(model)
            .map_or(0.0, |p| p.cost(prompt_tokens, completion_tokens))
    }

    /// Rejects configurations the runtime cannot execute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.agents {
            if profile.model.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("agents.{name}.model")));
            }
            if !(0.0..=2.0).contains(&profile.temperature) {
                return Err(ConfigError::InvalidValue {
                    field: format!("agents.{name}.temperature"),
                    reason: "must be between 0.0 and 2.0".to_string(),
                });
            }
        }
        for role in AgentRole::ALL {
            if !self.agents.contains_key(role.as_str()) {
                return Err(ConfigError::MissingField(format!("agents.{role}")));
            }
        }
        if self.refinement.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refinement.max_iterations".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let selection = &self.dynamic_selection;
        if selection.min_critics > selection.max_critics {
            return Err(ConfigError::InvalidValue {
                field: "dynamic_selection.min_critics".to_string(),
                reason: format!(
                    "{} exceeds max_critics {}",
                    selection.min_critics, selection.max_critics
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.context.semantic_weight) {
            return Err(ConfigError::InvalidValue {
                field: "context.semantic_weight".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.multi_critic.enabled {
            for critic in &self.multi_critic.critics {
                if !self.agents.contains_key(critic) {
                    return Err(ConfigError::InvalidValue {
                        field: "multi_critic.critics".to_string(),
                        reason: format!("no agent profile named {critic}"),
                    });
                }
            }
        }
        Ok(())
    }
}

fn default_agents() -> BTreeMap<String, AgentProfile> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "builder".to_string(),
        AgentProfile::new(
            "openai/gpt-4o",
            "You are BUILDER. Produce a complete, concrete solution to the request: architecture, code and the reasoning behind key decisions.",
        )
        .with_fallbacks(&["anthropic/claude-sonnet-4-5", "gemini/gemini-2.5-pro"]),
    );
    agents.insert(
        "critic".to_string(),
        AgentProfile::new(
            "anthropic/claude-sonnet-4-5",
            "You are CRITIC. Review the previous output. Flag CRITICAL problems, ERRORs, SECURITY risks and INCORRECT assumptions explicitly, one per line.",
        )
        .with_fallbacks(&["openai/gpt-4o", "gemini/gemini-2.5-pro"]),
    );
    agents.insert(
        "closer".to_string(),
        AgentProfile::new(
            "gemini/gemini-2.5-pro",
            "You are CLOSER. Merge the work so far into a final, actionable answer with clear next steps.",
        )
        .with_fallbacks(&["openai/gpt-4o", "anthropic/claude-sonnet-4-5"]),
    );
    agents.insert(
        ROUTER_AGENT.to_string(),
        AgentProfile::new(
            "gemini/gemini-flash-latest",
            "Classify the request. Answer with exactly one word: builder (create or design something), critic (review or find problems), or closer (summarize or finalize).",
        )
        .with_sampling(0.1, 10)
        .with_fallbacks(&["openai/gpt-4o-mini"]),
    );
    agents.insert(
        COMPRESSOR_AGENT.to_string(),
        AgentProfile::new(
            "gemini/gemini-flash-latest",
            "Compress the text into JSON with keys key_decisions, rationale, trade_offs, open_questions, technical_specs. Keep every concrete technology name.",
        )
        .with_sampling(0.1, 500)
        .with_fallbacks(&["openai/gpt-4o-mini"]),
    );
    agents.insert(
        "security-critic".to_string(),
        AgentProfile::new(
            "anthropic/claude-sonnet-4-5",
            "You are a SECURITY critic. List authentication, authorization, injection, secret-handling and data-exposure issues. Prefix serious findings with CRITICAL or SECURITY.",
        )
        .with_fallbacks(&["openai/gpt-4o"]),
    );
    agents.insert(
        "performance-critic".to_string(),
        AgentProfile::new(
            "openai/gpt-4o",
            "You are a PERFORMANCE critic. List latency, query, caching and scalability problems. Prefix serious findings with CRITICAL.",
        )
        .with_fallbacks(&["gemini/gemini-2.5-pro"]),
    );
    agents.insert(
        "code-quality-critic".to_string(),
        AgentProfile::new(
            "gemini/gemini-2.5-pro",
            "You are a CODE QUALITY critic. List design, readability, testing and maintainability problems. Prefix INCORRECT logic or ERROR handling gaps explicitly.",
        )
        .with_fallbacks(&["openai/gpt-4o"]),
    );
    agents
}
