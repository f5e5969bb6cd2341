//! Structured error type for the agent execution core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured, serializable error type for `jimi-core`.
///
/// Every variant carries typed context so callers can decide whether an
/// error is recoverable (fed back to the model as a tool message) or fatal
/// (ends the run with `Done(fatal_error)`).
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentError {
    // --- Tool dispatch (recoverable) ---
    #[error("invalid tool arguments for {tool_call_id}: {reason}")]
    InvalidToolArgs { tool_call_id: String, reason: String },

    #[error("tool execution failed for {tool_call_id}: {reason}")]
    ToolExecutionError { tool_call_id: String, reason: String },

    #[error("tool {tool_call_id} timed out after {elapsed_secs}s")]
    ToolTimeout {
        tool_call_id: String,
        elapsed_secs: u64,
    },

    #[error("tool call {tool_call_id} rejected by user")]
    UserRejected { tool_call_id: String },

    // --- Loop / context (fatal) ---
    #[error("LLM stream error: {reason}")]
    LlmStreamError { reason: String },

    #[error("context too large: {token_count} tokens exceeds limit {limit}")]
    ContextTooLarge { token_count: u64, limit: u64 },

    #[error("history file corrupt at {path}:{line}")]
    HistoryCorrupt { path: String, line: usize },

    #[error("checkpoint {0} is unknown")]
    CheckpointGone(usize),

    #[error("max steps reached")]
    MaxStepsReached,

    #[error("cancelled")]
    Cancelled,

    // --- Provider / transport (consumed, narrow surface) ---
    #[error("provider error: {0}")]
    Provider(String),

    // --- Generic internal ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Internal(format!("serialization error: {e}"))
    }
}

impl AgentError {
    /// True for errors that become tool-role messages visible to the model
    /// rather than aborting the run (§7 "Surfacing policy").
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidToolArgs { .. }
                | AgentError::ToolExecutionError { .. }
                | AgentError::ToolTimeout { .. }
                | AgentError::UserRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds_are_flagged() {
        assert!(
            AgentError::InvalidToolArgs {
                tool_call_id: "c1".into(),
                reason: "bad json".into()
            }
            .is_recoverable()
        );
        assert!(
            AgentError::UserRejected {
                tool_call_id: "c1".into()
            }
            .is_recoverable()
        );
        assert!(!AgentError::MaxStepsReached.is_recoverable());
        assert!(!AgentError::Cancelled.is_recoverable());
    }

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            AgentError::CheckpointGone(3).to_string(),
            "checkpoint 3 is unknown"
        );
        assert_eq!(AgentError::MaxStepsReached.to_string(), "max steps reached");
    }

    #[test]
    fn serde_round_trip() {
        let original = AgentError::ToolTimeout {
            tool_call_id: "c1".into(),
            elapsed_secs: 600,
        };
        let json = serde_json::to_string(&original).unwrap();
        let restored: AgentError = serde_json::from_str(&json).unwrap();
        assert_eq!(original.to_string(), restored.to_string());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{ bad").unwrap_err();
        let agent_err: AgentError = json_err.into();
        assert!(matches!(agent_err, AgentError::Internal(_)));
    }
}
