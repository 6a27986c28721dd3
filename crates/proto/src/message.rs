use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a new random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the raw session identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One of the fixed stage roles a prompt can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Produces the first draft of a solution.
    Builder,
    /// Reviews a draft and lists issues.
    Critic,
    /// Turns the reviewed draft into a final answer.
    Closer,
}

impl AgentRole {
    /// All routable roles, in default chain order.
    pub const ALL: [AgentRole; 3] = [AgentRole::Builder, AgentRole::Critic, AgentRole::Closer];

    /// Returns the configuration key for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Builder => "builder",
            AgentRole::Critic => "critic",
            AgentRole::Closer => "closer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builder" => Ok(AgentRole::Builder),
            "critic" => Ok(AgentRole::Critic),
            "closer" => Ok(AgentRole::Closer),
            other => Err(crate::error::ProtoError::InvalidRole(other.to_string())),
        }
    }
}
