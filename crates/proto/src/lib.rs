//! Shared protocol types for the gateway, agent runtime, and memory store.
//!
//! This crate defines the serializable call/run/conversation records,
//! chain progress events, and strongly-typed error enums shared across
//! the workspace.

pub mod conversation;
pub mod error;
pub mod event;
pub mod message;
pub mod outcome;

/// Re-export of persisted conversation types.
pub use conversation::{Conversation, MemoryStats, NewConversation, SearchFilter, UsageBucket};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of chain progress events.
pub use event::ChainProgress;
/// Re-export of role and session identity types.
pub use message::{AgentRole, SessionId};
/// Re-export of call and run record types.
pub use outcome::{CallOutcome, RunRecord};
