use serde::{Deserialize, Serialize};

/// Real-time progress events emitted while a chain or refinement loop runs.
///
/// These events are sent via `tokio::sync::mpsc` from
/// `AgentRuntime::chain_with_progress()` so that consumers (e.g. the CLI)
/// can show which stage is running before its output is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainProgress {
    /// A stage is about to call its model. `index` is 1-based; `total` is 0
    /// during refinement, where the number of stages is not known up front.
    StageStarted {
        index: usize,
        total: usize,
        agent: String,
    },
    /// A stage returned, successfully or with an error.
    StageFinished {
        index: usize,
        total: usize,
        agent: String,
        model: String,
        total_tokens: u32,
        failed: bool,
    },
    /// A refinement iteration started. `iteration` is 1-based.
    IterationStarted { iteration: u32, max_iterations: u32 },
    /// Critics selected for the current builder output.
    CriticsSelected { critics: Vec<String> },
}

impl ChainProgress {
    /// Agent the event refers to, if any.
    pub fn agent(&self) -> Option<&str> {
        match self {
            ChainProgress::StageStarted { agent, .. } | ChainProgress::StageFinished { agent, .. } => {
                Some(agent)
            }
            _ => None,
        }
    }
}
