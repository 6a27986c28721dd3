//! Model gateway: provider resolution, credential checks, and the
//! retry/fallback executor that turns a call into a [`proto::CallOutcome`].

pub mod executor;
pub mod failure;
pub mod invoke;
pub mod provider;
pub mod router;

/// Call-with-fallback executor and its policy.
pub use executor::{CallRequest, GatewayConfig, GatewayExecutor};
/// Per-candidate failure taxonomy.
pub use failure::{CandidateFailure, FailureClass, classify_error, inspect_empty_text};
/// Model invocation capability.
pub use invoke::{Completion, InvokeRequest, ModelInvoker};
/// Provider resolution and credentials.
pub use provider::{
    EnvCredentials, ModelCandidate, PROVIDER_REGISTRY, ProviderCredentials, ProviderRegistryEntry,
    StaticCredentials, model_name, registry_entry, resolve_provider,
};
/// Provider-prefix dispatcher.
pub use router::ProviderDispatcher;
