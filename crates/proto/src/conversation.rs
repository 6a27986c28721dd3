use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::SessionId;

/// A persisted prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Store-assigned row id, monotonically increasing.
    pub id: i64,
    pub prompt: String,
    pub response: String,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<SessionId>,
    /// Decoded embedding vector, if one has been attached.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Insert payload for a conversation; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub prompt: String,
    pub response: String,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub session_id: Option<SessionId>,
    /// Defaults to the insert time when `None`.
    pub timestamp: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
}

impl NewConversation {
    /// Creates an insert payload with zeroed usage metadata.
    pub fn new(
        prompt: impl Into<String>,
        response: impl Into<String>,
        agent: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
            agent: agent.into(),
            model: model.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, total_tokens: i64, cost_usd: f64) -> Self {
        self.total_tokens = total_tokens;
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Conjunctive search filter over stored conversations.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    /// Case-insensitive substring matched against prompt OR response.
    pub query: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
    pub limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            query: None,
            agent: None,
            model: None,
            from: None,
            to: None,
            session_id: None,
            limit: 10,
        }
    }
}

impl SearchFilter {
    /// Filter matching `query` with the default limit.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Aggregate usage for one agent or model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub conversations: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

/// Aggregate statistics over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_conversations: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub by_agent: BTreeMap<String, UsageBucket>,
    pub by_model: BTreeMap<String, UsageBucket>,
}
