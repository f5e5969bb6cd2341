//! Sub-agent task launcher (C7, `spec.md` §4.7). Registered as the `Task`
//! tool whenever the resolved agent spec declares at least one sub-agent.
//! Grounded directionally in the teacher's delegation module (child session
//! sharing the parent's bus/gate, own history file), simplified to this
//! core's single-process executor shape.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent_spec::AgentSpec;
use crate::approval::ApprovalGate;
use crate::context::Context;
use crate::event_bus::EventBus;
use crate::events::DoneCause;
use crate::executor::{CancelSignal, Executor, ExecutorConfig};
use crate::llm::LlmProvider;
use crate::message::{ContentPart, Role};
use crate::tools::context::{Tool, ToolContext, ToolError, ToolOutcome};
use crate::tools::{Dispatcher, ToolRegistry};

/// Minimum final-text length before the launcher auto-continues the child
/// with one extra turn (§4.7 "Auto-continue").
const AUTO_CONTINUE_THRESHOLD: usize = 200;
const AUTO_CONTINUE_PROMPT: &str = "Please continue and provide more detail.";

/// Collaborators a `Task` tool needs to spin up an isolated child executor.
/// Shared with the parent by reference, never owned uniquely — multiple
/// concurrent `Task` calls (from different parent sessions) can reuse one
/// `SubagentTool` instance.
pub struct SubagentTool {
    parent_history_stem: PathBuf,
    bus: Arc<EventBus>,
    gate: Arc<ApprovalGate>,
    provider: Arc<dyn LlmProvider>,
    registry_factory: Box<dyn Fn() -> ToolRegistry + Send + Sync>,
    agent_spec: Arc<AgentSpec>,
    cancel_signal: CancelSignal,
    /// The session's own tool context, reused (not cloned) for every child —
    /// children share the parent's working directory and cancellation
    /// wiring, only their history file and context differ.
    tool_context: Arc<dyn ToolContext>,
    child_seq: AtomicU64,
}

impl SubagentTool {
    pub fn new(
        parent_history_stem: PathBuf,
        bus: Arc<EventBus>,
        gate: Arc<ApprovalGate>,
        provider: Arc<dyn LlmProvider>,
        registry_factory: impl Fn() -> ToolRegistry + Send + Sync + 'static,
        agent_spec: Arc<AgentSpec>,
        cancel_signal: CancelSignal,
        tool_context: Arc<dyn ToolContext>,
    ) -> Self {
        SubagentTool {
            parent_history_stem,
            bus,
            gate,
            provider,
            registry_factory: Box::new(registry_factory),
            agent_spec,
            cancel_signal,
            tool_context,
            child_seq: AtomicU64::new(0),
        }
    }

    fn child_history_path(&self) -> PathBuf {
        let n = self.child_seq.fetch_add(1, Ordering::Relaxed);
        let stem = self
            .parent_history_stem
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("session");
        let dir = self
            .parent_history_stem
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        dir.join(format!("{stem}_sub_{n}.jsonl"))
    }

    async fn run_child(&self, subagent_name: &str, prompt: String) -> Result<String, ToolError> {
        let subagent_spec = self
            .agent_spec
            .subagents
            .get(subagent_name)
            .ok_or_else(|| ToolError::InvalidRequest(format!("unknown subagent '{subagent_name}'")))?;

        let child_agent_spec = subagent_spec
            .resolve()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let context = Arc::new(Context::with_history_file(self.child_history_path()));
        let dispatcher = Arc::new(Dispatcher::new((self.registry_factory)()));
        let child_session_id = format!("{}-sub", self.tool_context.session_id());

        let executor = Executor::new(
            child_session_id,
            self.bus.clone(),
            context.clone(),
            self.gate.clone(),
            self.provider.clone(),
            dispatcher,
            self.tool_context.clone(),
            child_agent_spec,
            self.cancel_signal.clone(),
            ExecutorConfig::default(),
        );

        let turn_start = context.len().await;
        run_to_completion(&executor, vec![ContentPart::text(prompt)]).await?;
        let mut final_text = assistant_text_since(&context, turn_start).await;

        // Auto-continue (§4.7): if the child's output so far is short, feed
        // it one more user turn in the *same* conversation and let it keep
        // going, rather than starting a fresh child with no memory of the
        // original prompt.
        if final_text.chars().count() < AUTO_CONTINUE_THRESHOLD {
            let continue_start = context.len().await;
            run_to_completion(&executor, vec![ContentPart::text(AUTO_CONTINUE_PROMPT)]).await?;
            let continued = assistant_text_since(&context, continue_start).await;
            if !continued.is_empty() {
                final_text = continued;
            }
        }

        // Isolation invariant: only the final assistant text is visible to
        // the parent, never the child's intermediate messages.
        Ok(final_text)
    }
}

async fn run_to_completion(executor: &Executor, user_input: Vec<ContentPart>) -> Result<(), ToolError> {
    let cause = executor.execute(user_input).await;
    if matches!(cause, DoneCause::FatalError) {
        return Err(ToolError::ExecutionFailed(
            "sub-agent terminated with a fatal error".to_string(),
        ));
    }
    Ok(())
}

/// Joins the assistant messages appended since `start` (a message index, from
/// `Context::len`), so an auto-continue retry yields only its own new text
/// rather than the whole conversation so far.
async fn assistant_text_since(context: &Context, start: usize) -> String {
    context
        .snapshot_history()
        .await
        .iter()
        .skip(start)
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "Task"
    }

    fn description(&self) -> &str {
        "Delegate a task to a named sub-agent and return its final response."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": { "type": "string" },
                "subagent_name": { "type": "string" },
                "prompt": { "type": "string" },
            },
            "required": ["subagent_name", "prompt"],
        })
    }

    async fn call(
        &self,
        tool_call: &crate::message::ToolCall,
        _context: &dyn ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let args = tool_call
            .parsed_arguments()
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        let subagent_name = args
            .get("subagent_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidRequest("missing 'subagent_name'".to_string()))?;
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidRequest("missing 'prompt'".to_string()))?;

        let result = self.run_child(subagent_name, prompt.to_string()).await?;
        Ok(ToolOutcome::ok(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_spec::SubagentSpec;
    use crate::test_support::{MockLlmProvider, NullToolContext, ScriptedStream};

    fn agent_spec_with_subagent() -> Arc<AgentSpec> {
        let mut spec = AgentSpec::new("main", "you are jimi");
        spec.subagents.insert(
            "reviewer".to_string(),
            SubagentSpec::new("reviewer.md", "reviews code", |_path| {
                Ok(AgentSpec::new("reviewer", "you are a reviewer"))
            }),
        );
        Arc::new(spec)
    }

    #[tokio::test]
    async fn unknown_subagent_name_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(ApprovalGate::yolo());
        let provider: Arc<dyn LlmProvider> =
            Arc::new(MockLlmProvider::with_streams(vec![ScriptedStream::content_only("x")]));
        let agent_spec = agent_spec_with_subagent();

        let tool = SubagentTool::new(
            PathBuf::from("/tmp/session/history.jsonl"),
            bus,
            gate,
            provider,
            ToolRegistry::new,
            agent_spec,
            CancelSignal::new(),
            Arc::new(NullToolContext::new("s1")),
        );

        let err = tool
            .run_child("ghost", "do something".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn short_final_text_triggers_one_auto_continue_retry() {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(ApprovalGate::yolo());
        let provider: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::with_streams(vec![
            ScriptedStream::content_only("short"),
            ScriptedStream::content_only("a".repeat(250)),
        ]));
        let agent_spec = agent_spec_with_subagent();

        let tool = SubagentTool::new(
            PathBuf::from("/tmp/session/history.jsonl"),
            bus,
            gate,
            provider,
            ToolRegistry::new,
            agent_spec,
            CancelSignal::new(),
            Arc::new(NullToolContext::new("s1")),
        );

        let result = tool
            .run_child("reviewer", "review this".to_string())
            .await
            .unwrap();
        assert_eq!(result.chars().count(), 250);
    }
}
