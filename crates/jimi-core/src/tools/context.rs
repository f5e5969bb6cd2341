//! `Tool`/`ToolContext` traits (C4, `spec.md` §4.4, §6). Grounded directly in
//! the teacher's `tools::context` module: the same trait split between "what
//! a tool needs from its environment" (`ToolContext`) and "what a tool is"
//! (`Tool`), and the same `thiserror` shape for `ToolError`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::ToolCall;

/// Timeout applied to a tool's `call` when it doesn't override `Tool::timeout`
/// (§4.4 "Wrap with a timeout (default 600 s, per-tool override)").
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// Error produced by a tool's `execute`, mapped onto the dispatcher's
/// textual contract (§4.4 "Output formatting contract").
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Outcome of a tool's `execute`, per the consumed tool interface (§6).
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub output: String,
    pub message: String,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        ToolOutcome {
            output: output.into(),
            message: String::new(),
        }
    }

    pub fn with_message(output: impl Into<String>, message: impl Into<String>) -> Self {
        ToolOutcome {
            output: output.into(),
            message: message.into(),
        }
    }
}

/// What a tool needs from its environment at call time. Narrow by design —
/// cancellation is passed in rather than stashed on the tool itself so a
/// single tool instance can serve concurrent sub-agent sessions.
#[async_trait]
pub trait ToolContext: Send + Sync {
    fn session_id(&self) -> &str;
    fn cwd(&self) -> &std::path::Path;
    fn cancel_signal(&self) -> tokio_util::sync::CancellationToken;
}

/// A registered, invocable tool (§6 "Tool interface (consumed)").
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for `arguments_json_text`, exported as part of
    /// `schemas_for` (§4.4).
    fn input_schema(&self) -> serde_json::Value;
    /// When true, the approval gate prompts before every invocation unless
    /// the function is already `session_allowed` or the gate is `yolo`.
    fn requires_approval(&self) -> bool {
        false
    }

    /// Per-tool timeout override (§4.4). Tools that wrap a slow external
    /// process (a browser fetch, a long shell command) override this;
    /// everything else gets the 600s default.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn call(
        &self,
        tool_call: &ToolCall,
        context: &dyn ToolContext,
    ) -> Result<ToolOutcome, ToolError>;
}
