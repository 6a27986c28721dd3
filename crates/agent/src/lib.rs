//! Agent runtime: provider clients, routing, critics, refinement, memory
//! and context retrieval.

pub mod anthropic;
pub mod config;
pub mod consensus;
pub mod context;
pub mod convergence;
pub mod embedding;
pub mod llm;
pub mod memory;
pub mod router;
pub mod run_log;
pub mod runtime;
pub mod summarize;

/// Anthropic Messages API provider.
pub use anthropic::AnthropicProvider;
/// Orchestration configuration types.
pub use config::{
    AgentProfile, AgentsConfig, COMPRESSOR_AGENT, ConsensusConfig, ContextConfig, DynamicSelectionConfig,
    MemoryPolicy, ModelPricing, MultiCriticConfig, ROUTER_AGENT, RefinementConfig, SummaryConfig, SummaryMode,
};
/// Critic selection and consensus merge.
pub use consensus::{CriticFinding, MultiCriticReport, merge_consensus, select_critics};
/// Memory context retrieval.
pub use context::{ContextAssembler, ContextRequest, ContextStrategy, extract_keywords};
/// Refinement stop decision.
pub use convergence::{ConvergenceDecision, check_convergence, extract_critical_issues};
/// Lazily loaded embedding model and similarity helpers.
pub use embedding::{
    EmbeddingModel, EmbeddingModelLoader, EmbeddingService, OpenAiEmbeddingLoader, cosine_similarity,
    find_most_similar,
};
/// OpenAI-compatible chat completions provider.
pub use llm::OpenAiProvider;
/// SQLite-backed conversation memory implementation.
pub use memory::SqliteMemory;
/// Run log sinks.
pub use run_log::{InMemoryRunLog, JsonRunLog, RunLogger};
/// Main runtime orchestration façade.
pub use runtime::{AUTO_AGENT, AgentRuntime, ChainReport, IterationReport, RefinementReport, RunOptions};
/// Stage summarisation helpers.
pub use summarize::{compress_semantic, intelligent_truncate};
