//! Agent loop executor (C6, `spec.md` §4.6). Explicit state machine driven
//! by a `loop` in `Executor::run`, grounded in the teacher's
//! `execute_cycle_state_machine` pattern but without its middleware-driver
//! indirection (no plugin system in scope here).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent_spec::AgentSpec;
use crate::approval::ApprovalGate;
use crate::compactor;
use crate::context::Context;
use crate::event_bus::EventBus;
use crate::events::{DoneCause, EventKind, TokenUsage};
use crate::llm::LlmProvider;
use crate::message::{Content, ContentPart, Message};
use crate::stream::StreamAccumulator;
use crate::tools::context::ToolContext;
use crate::tools::Dispatcher;

/// Steps whose assistant message carried no tool calls before a forced
/// natural termination (§4.6, §8 invariant 7).
const MAX_CONSECUTIVE_EMPTY_STEPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutorState {
    BeforeStep,
    CallingLlm,
    AfterLlm,
    DispatchingTools,
    Done,
}

/// External cancellation flag, shared with sub-agents spawned by this
/// session (§5 "Sub-agents share the parent's signal").
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ExecutorConfig {
    pub max_steps_per_run: usize,
    pub force_compaction_next_step: Arc<AtomicBool>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_steps_per_run: 100,
            force_compaction_next_step: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct Executor {
    session_id: String,
    bus: Arc<EventBus>,
    context: Arc<Context>,
    gate: Arc<ApprovalGate>,
    provider: Arc<dyn LlmProvider>,
    dispatcher: Arc<Dispatcher>,
    tool_context: Arc<dyn ToolContext>,
    agent_spec: Arc<AgentSpec>,
    cancel_signal: CancelSignal,
    config: ExecutorConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        bus: Arc<EventBus>,
        context: Arc<Context>,
        gate: Arc<ApprovalGate>,
        provider: Arc<dyn LlmProvider>,
        dispatcher: Arc<Dispatcher>,
        tool_context: Arc<dyn ToolContext>,
        agent_spec: Arc<AgentSpec>,
        cancel_signal: CancelSignal,
        config: ExecutorConfig,
    ) -> Self {
        Executor {
            session_id: session_id.into(),
            bus,
            context,
            gate,
            provider,
            dispatcher,
            tool_context,
            agent_spec,
            cancel_signal,
            config,
        }
    }

    /// Entry point (§4.6 "Entry point"): creates checkpoint 0, appends the
    /// user message, runs the step loop, and publishes `Done`.
    pub async fn execute(&self, user_input: Vec<ContentPart>) -> DoneCause {
        self.context.checkpoint().await;
        let content = if user_input.is_empty() {
            Content::text(String::new())
        } else {
            Content::Parts(user_input)
        };
        let _ = self
            .context
            .append(Message {
                role: crate::message::Role::User,
                content,
                tool_calls: None,
                tool_call_id: None,
            })
            .await;

        let (cause, reason) = self.run_steps().await;
        self.bus
            .publish(&self.session_id, EventKind::Done { cause, reason });
        cause
    }

    async fn run_steps(&self) -> (DoneCause, Option<String>) {
        let mut step_no: usize = 1;
        let mut consecutive_empty_steps: u32 = 0;
        let mut state = ExecutorState::BeforeStep;
        let mut assistant_message: Option<Message> = None;

        loop {
            state = match state {
                ExecutorState::BeforeStep => {
                    let span = tracing::info_span!("agent.step", step_no);
                    {
                        let _enter = span.enter();
                        if step_no > self.config.max_steps_per_run {
                            return (DoneCause::MaxSteps, None);
                        }
                        if self.cancel_signal.is_set() {
                            return (DoneCause::Cancelled, None);
                        }

                        self.bus
                            .publish(&self.session_id, EventKind::StepBegin { step_no });
                    }

                    if self.should_compact().await {
                        compactor::compact(&self.bus, &self.session_id, &self.context, &self.provider)
                            .await;
                    }
                    self.context.checkpoint().await;

                    ExecutorState::CallingLlm
                }

                ExecutorState::CallingLlm => {
                    let system_prompt = self.agent_spec.system_prompt_template.clone();
                    let history = self.context.snapshot_history().await;
                    let schemas = self.dispatcher.registry().schemas_for(
                        self.agent_spec.allowed_tools.as_ref(),
                        &self.agent_spec.excluded_tools,
                    );

                    match self.provider.stream(&system_prompt, &history, &schemas).await {
                        Ok(mut chunk_stream) => {
                            let mut accumulator = StreamAccumulator::new();
                            let mut cancelled = false;
                            let mut stream_error = None;

                            loop {
                                if self.cancel_signal.is_set() {
                                    cancelled = true;
                                    break;
                                }
                                match chunk_stream.next().await {
                                    Some(Ok(chunk)) => {
                                        let is_done = matches!(chunk, crate::stream::LlmChunk::Done { .. });
                                        accumulator.feed(&self.bus, &self.session_id, chunk);
                                        if is_done {
                                            break;
                                        }
                                    }
                                    Some(Err(err)) => {
                                        stream_error = Some(err);
                                        break;
                                    }
                                    None => break,
                                }
                            }

                            if cancelled {
                                self.bus
                                    .publish(&self.session_id, EventKind::StepInterrupted);
                                return (DoneCause::Cancelled, None);
                            }
                            if let Some(err) = stream_error {
                                self.bus.publish(
                                    &self.session_id,
                                    EventKind::Error {
                                        message: err.to_string(),
                                    },
                                );
                                return (DoneCause::FatalError, Some(err.to_string()));
                            }

                            let usage = accumulator.usage().cloned();
                            let message = accumulator.finish(&self.bus, &self.session_id);
                            assistant_message = Some(message.clone());

                            let _ = self.context.append(message).await;
                            self.record_usage(usage).await;
                        }
                        Err(err) => {
                            self.bus.publish(
                                &self.session_id,
                                EventKind::Error {
                                    message: err.to_string(),
                                },
                            );
                            return (DoneCause::FatalError, Some(err.to_string()));
                        }
                    }

                    ExecutorState::AfterLlm
                }

                ExecutorState::AfterLlm => {
                    let message = assistant_message.take().expect("set in CallingLlm");
                    match &message.tool_calls {
                        None => {
                            consecutive_empty_steps += 1;
                            self.bus
                                .publish(&self.session_id, EventKind::StepEnd { step_no });
                            let reason = if consecutive_empty_steps >= MAX_CONSECUTIVE_EMPTY_STEPS {
                                Some("forced completion".to_string())
                            } else {
                                None
                            };
                            return (DoneCause::Natural, reason);
                        }
                        Some(_) => {
                            consecutive_empty_steps = 0;
                            assistant_message = Some(message);
                            ExecutorState::DispatchingTools
                        }
                    }
                }

                ExecutorState::DispatchingTools => {
                    let message = assistant_message.take().expect("set in AfterLlm");
                    let tool_calls = message.tool_calls.unwrap_or_default();

                    let outcome = self
                        .dispatcher
                        .run(
                            &self.bus,
                            &self.gate,
                            &self.context,
                            self.tool_context.as_ref(),
                            &self.session_id,
                            &tool_calls,
                        )
                        .await;

                    self.bus
                        .publish(&self.session_id, EventKind::StepEnd { step_no });

                    if outcome.loop_should_terminate {
                        return (DoneCause::Natural, Some("repeated errors".to_string()));
                    }

                    step_no += 1;
                    ExecutorState::BeforeStep
                }

                ExecutorState::Done => return (DoneCause::Natural, None),
            };
        }
    }

    async fn should_compact(&self) -> bool {
        if self
            .config
            .force_compaction_next_step
            .swap(false, Ordering::SeqCst)
        {
            return true;
        }
        let token_count = self.context.token_count().await;
        compactor::should_compact(token_count, self.provider.max_context_size())
    }

    async fn record_usage(&self, usage: Option<TokenUsage>) {
        match usage {
            Some(usage) => {
                self.context.update_token_count(usage.total).await;
                self.bus
                    .publish(&self.session_id, EventKind::TokenUsage { usage });
            }
            None => {
                let token_count = self.context.token_count().await;
                self.bus.publish(
                    &self.session_id,
                    EventKind::TokenUsage {
                        usage: TokenUsage {
                            prompt: 0,
                            completion: 0,
                            total: token_count,
                        },
                    },
                );
            }
        }
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel_signal.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockLlmProvider, NullToolContext, ScriptedStream};
    use crate::tools::{Dispatcher, ToolRegistry};

    fn make_executor(provider: MockLlmProvider) -> (Executor, Arc<EventBus>, Arc<Context>) {
        let bus = Arc::new(EventBus::new());
        let context = Arc::new(Context::new());
        let gate = Arc::new(ApprovalGate::yolo());
        let dispatcher = Arc::new(Dispatcher::new(ToolRegistry::new()));
        let tool_context = Arc::new(NullToolContext::new("s1"));
        let agent_spec = Arc::new(AgentSpec::new("main", "you are jimi"));

        let executor = Executor::new(
            "s1",
            bus.clone(),
            context.clone(),
            gate,
            Arc::new(provider),
            dispatcher,
            tool_context,
            agent_spec,
            CancelSignal::new(),
            ExecutorConfig::default(),
        );
        (executor, bus, context)
    }

    #[tokio::test]
    async fn echo_with_no_tools_completes_naturally() {
        let provider = MockLlmProvider::with_streams(vec![ScriptedStream::content_only("Hi there.")]);
        let (executor, _bus, context) = make_executor(provider);

        let cause = executor
            .execute(vec![ContentPart::text("Hello")])
            .await;

        assert_eq!(cause, DoneCause::Natural);
        assert_eq!(context.len().await, 2);
    }

    #[tokio::test]
    async fn empty_user_input_still_creates_checkpoint_and_runs_one_step() {
        let provider = MockLlmProvider::with_streams(vec![ScriptedStream::content_only("ok")]);
        let (executor, _bus, context) = make_executor(provider);

        let cause = executor.execute(vec![]).await;
        assert_eq!(cause, DoneCause::Natural);
        assert_eq!(context.len().await, 2);
    }

    #[tokio::test]
    async fn zero_chunks_increments_empty_steps_and_terminates() {
        let provider = MockLlmProvider::with_streams(vec![ScriptedStream::empty()]);
        let (executor, _bus, _context) = make_executor(provider);

        let cause = executor.execute(vec![ContentPart::text("hi")]).await;
        assert_eq!(cause, DoneCause::Natural);
    }

    #[tokio::test]
    async fn cancellation_before_step_yields_cancelled() {
        let provider = MockLlmProvider::with_streams(vec![ScriptedStream::content_only("unused")]);
        let (executor, _bus, _context) = make_executor(provider);
        executor.cancel_signal().set();

        let cause = executor.execute(vec![ContentPart::text("hi")]).await;
        assert_eq!(cause, DoneCause::Cancelled);
    }

    struct ReadFileTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool for ReadFileTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "reads a file"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(
            &self,
            _call: &crate::message::ToolCall,
            _context: &dyn crate::tools::ToolContext,
        ) -> Result<crate::tools::ToolOutcome, crate::tools::ToolError> {
            Ok(crate::tools::ToolOutcome::ok("contents"))
        }
    }

    struct AlwaysFailsTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool for AlwaysFailsTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(
            &self,
            _call: &crate::message::ToolCall,
            _context: &dyn crate::tools::ToolContext,
        ) -> Result<crate::tools::ToolOutcome, crate::tools::ToolError> {
            Err(crate::tools::ToolError::ExecutionFailed("nope".to_string()))
        }
    }

    struct GatedTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool for GatedTool {
        fn name(&self) -> &str {
            "rm"
        }
        fn description(&self) -> &str {
            "needs approval"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn requires_approval(&self) -> bool {
            true
        }
        async fn call(
            &self,
            _call: &crate::message::ToolCall,
            _context: &dyn crate::tools::ToolContext,
        ) -> Result<crate::tools::ToolOutcome, crate::tools::ToolError> {
            Ok(crate::tools::ToolOutcome::ok("deleted"))
        }
    }

    fn make_executor_with_registry(
        provider: MockLlmProvider,
        registry: ToolRegistry,
        gate: ApprovalGate,
    ) -> (Executor, Arc<EventBus>, Arc<Context>) {
        let bus = Arc::new(EventBus::new());
        let context = Arc::new(Context::new());
        let gate = Arc::new(gate);
        let dispatcher = Arc::new(Dispatcher::new(registry));
        let tool_context = Arc::new(NullToolContext::new("s1"));
        let agent_spec = Arc::new(AgentSpec::new("main", "you are jimi"));

        let executor = Executor::new(
            "s1",
            bus.clone(),
            context.clone(),
            gate,
            Arc::new(provider),
            dispatcher,
            tool_context,
            agent_spec,
            CancelSignal::new(),
            ExecutorConfig::default(),
        );
        (executor, bus, context)
    }

    /// S2 (§8): a single successful tool call is dispatched, its result is
    /// appended to history, and the loop continues to a natural finish.
    #[tokio::test]
    async fn single_successful_tool_call_completes_naturally() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(ReadFileTool));
        let provider = MockLlmProvider::with_streams(vec![
            ScriptedStream::tool_call("call_1", "read_file", "{}"),
            ScriptedStream::content_only("all done"),
        ]);
        let (executor, _bus, context) =
            make_executor_with_registry(provider, registry, ApprovalGate::yolo());

        let cause = executor.execute(vec![ContentPart::text("read it")]).await;

        assert_eq!(cause, DoneCause::Natural);
        let history = context.snapshot_history().await;
        assert!(history
            .iter()
            .any(|m| m.role == crate::message::Role::Tool && m.content.as_text().contains("contents")));
    }

    /// S3 (§8): three consecutive identical tool-call failures end the run
    /// without exhausting `max_steps_per_run`.
    #[tokio::test]
    async fn three_repeated_tool_failures_terminate_the_run() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(AlwaysFailsTool));
        let provider = MockLlmProvider::with_streams(vec![
            ScriptedStream::tool_call("c1", "broken", "{}"),
            ScriptedStream::tool_call("c2", "broken", "{}"),
            ScriptedStream::tool_call("c3", "broken", "{}"),
        ]);
        let (executor, _bus, context) =
            make_executor_with_registry(provider, registry, ApprovalGate::yolo());

        let cause = executor.execute(vec![ContentPart::text("try this")]).await;

        assert_eq!(cause, DoneCause::Natural);
        let history = context.snapshot_history().await;
        assert!(history.last().unwrap().content.as_text().contains("three times in a row"));
    }

    /// S4 (§8): a denied approval is reported as a failed tool result and the
    /// run continues rather than aborting outright.
    #[tokio::test]
    async fn denied_approval_reports_failure_and_continues() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(GatedTool));
        let provider = MockLlmProvider::with_streams(vec![
            ScriptedStream::tool_call("c1", "rm", "{}"),
            ScriptedStream::content_only("ok, skipping that"),
        ]);
        let (executor, bus, context) =
            make_executor_with_registry(provider, registry, ApprovalGate::new());

        let responder = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus.respond_approval("c1", crate::events::ApprovalDecision::Reject);
        });

        let cause = executor.execute(vec![ContentPart::text("delete it")]).await;
        responder.await.unwrap();

        assert_eq!(cause, DoneCause::Natural);
        let history = context.snapshot_history().await;
        assert!(history
            .iter()
            .any(|m| m.role == crate::message::Role::Tool && m.content.as_text() == "Rejected by user"));
    }
}
