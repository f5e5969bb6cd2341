//! Serial tool dispatcher (C4, `spec.md` §4.4). The dispatch algorithm,
//! output truncation, and error-repetition detection are specified exactly;
//! grounded in the teacher's dispatch loop shape but without its
//! parallel/merge code path (the spec mandates strictly sequential
//! execution, see `SPEC_FULL.md` §9 open-question resolution).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::approval::{ApprovalGate, Decision};
use crate::context::Context;
use crate::event_bus::EventBus;
use crate::events::EventKind;
use crate::message::{Message, ToolCall};
use crate::tools::context::{ToolContext, ToolError};
use crate::tools::registry::ToolRegistry;

const OUTPUT_TOTAL_CAP: usize = 50_000;
const OUTPUT_LINE_CAP: usize = 2_000;
const TRUNCATION_MARKER: &str = "[...truncated]";
const ERROR_REPETITION_WINDOW: usize = 3;
const OUTPUT_PREVIEW_CHARS: usize = 100;

/// Truncate `text` to at most `OUTPUT_TOTAL_CAP` chars total, capping each
/// line at `OUTPUT_LINE_CAP` chars; truncated content is replaced with the
/// literal marker at the truncation boundary (§4.4 "Capture stdout/stderr").
pub fn truncate_output(text: &str) -> String {
    let mut out = String::new();
    let mut total = 0usize;

    for line in text.split('\n') {
        if total >= OUTPUT_TOTAL_CAP {
            if !out.ends_with(TRUNCATION_MARKER) {
                out.push_str(TRUNCATION_MARKER);
            }
            break;
        }

        let line_chars: Vec<char> = line.chars().collect();
        let (kept, line_truncated) = if line_chars.len() > OUTPUT_LINE_CAP {
            (line_chars[..OUTPUT_LINE_CAP].iter().collect::<String>(), true)
        } else {
            (line.to_string(), false)
        };

        let remaining = OUTPUT_TOTAL_CAP - total;
        let kept = if kept.chars().count() > remaining {
            kept.chars().take(remaining).collect::<String>()
        } else {
            kept
        };

        total += kept.chars().count();
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&kept);
        if line_truncated || total >= OUTPUT_TOTAL_CAP {
            out.push_str(TRUNCATION_MARKER);
        }
    }

    out
}

fn format_tool_content(output: &str, message: &str) -> String {
    match (output.is_empty(), message.is_empty()) {
        (true, true) => String::new(),
        (false, true) => output.to_string(),
        (true, false) => message.to_string(),
        (false, false) => format!("{output}\n\n{message}"),
    }
}

/// Tracks consecutive identical failing signatures to detect a stuck loop
/// (§4.4 "Error-repetition detection", §8 invariant 6).
struct ErrorTracker {
    recent_failures: VecDeque<String>,
}

impl ErrorTracker {
    fn new() -> Self {
        ErrorTracker {
            recent_failures: VecDeque::new(),
        }
    }

    fn record_failure(&mut self, signature: String) -> bool {
        self.recent_failures.push_back(signature);
        if self.recent_failures.len() > ERROR_REPETITION_WINDOW {
            self.recent_failures.pop_front();
        }
        self.recent_failures.len() == ERROR_REPETITION_WINDOW
            && self.recent_failures.iter().all(|s| s == &self.recent_failures[0])
    }

    fn record_success(&mut self) {
        self.recent_failures.clear();
    }
}

pub struct DispatchOutcome {
    pub loop_should_terminate: bool,
}

pub struct Dispatcher {
    registry: ToolRegistry,
    error_tracker: std::sync::Mutex<ErrorTracker>,
    temp_id_seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Dispatcher {
            registry,
            error_tracker: std::sync::Mutex::new(ErrorTracker::new()),
            temp_id_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Run every tool call in `tool_calls` sequentially, publishing bus
    /// events as it goes, then append the resulting tool messages to
    /// `context` in one atomic batch (§4.4 steps 1-2).
    pub async fn run(
        &self,
        bus: &EventBus,
        gate: &ApprovalGate,
        context: &Context,
        tool_context: &dyn ToolContext,
        session_id: &str,
        tool_calls: &[ToolCall],
    ) -> DispatchOutcome {
        let mut results = Vec::with_capacity(tool_calls.len());
        let mut loop_should_terminate = false;

        for call in tool_calls {
            bus.publish(
                session_id,
                EventKind::ToolCallAnnounce {
                    tool_call: call.clone(),
                },
            );

            let (content, ok, preview, insight) =
                self.run_one(bus, gate, tool_context, session_id, call).await;

            if ok {
                self.error_tracker.lock().unwrap().record_success();
                if let Some(insight) = insight {
                    context.add_key_insight(insight).await;
                }
            } else {
                let repeated = self
                    .error_tracker
                    .lock()
                    .unwrap()
                    .record_failure(call.signature());
                if repeated {
                    loop_should_terminate = true;
                }
            }

            bus.publish(
                session_id,
                EventKind::ToolResult {
                    tool_call_id: call.id.clone(),
                    ok,
                    output_preview: preview,
                    message: String::new(),
                },
            );

            results.push(Message::tool_result(call.id.clone(), content));
        }

        if loop_should_terminate {
            if let Some(last) = results.last_mut() {
                last.content = crate::message::Content::text(format!(
                    "{}\n\nYou have failed the same tool call three times in a row. Stop retrying this exact approach and try something fundamentally different.",
                    last.content.as_text()
                ));
            }
        }

        context
            .append_batch(results)
            .await
            .expect("context append_batch is infallible for in-memory history");

        DispatchOutcome { loop_should_terminate }
    }

    #[tracing::instrument(name = "agent.tool_call", skip_all, fields(tool_call_id = %call.id, function = %call.function_name))]
    async fn run_one(
        &self,
        bus: &EventBus,
        gate: &ApprovalGate,
        tool_context: &dyn ToolContext,
        session_id: &str,
        call: &ToolCall,
    ) -> (String, bool, String, Option<String>) {
        if call.id.is_empty() {
            return self.fail("tool call id is empty", call);
        }

        let Some(tool) = self.registry.find(&call.function_name) else {
            return self.fail(&format!("unknown tool '{}'", call.function_name), call);
        };

        let args = match call.parsed_arguments() {
            Ok(v) => v,
            Err(e) => return self.fail(&format!("invalid arguments JSON: {e}"), call),
        };
        if let Err(reason) = validate_required_fields(&tool.input_schema(), &args) {
            return self.fail(&reason, call);
        }

        if tool.requires_approval() {
            let decision = gate
                .gate(
                    bus,
                    session_id,
                    call,
                    &format!("run {}", call.function_name),
                    &call.arguments_json_text,
                )
                .await;
            if decision == Decision::Deny {
                let content = "Rejected by user".to_string();
                let preview = preview_of(&content);
                return (content, false, preview, None);
            }
        }

        let timeout = tool.timeout();
        match tokio::time::timeout(timeout, tool.call(call, tool_context)).await {
            Ok(Ok(outcome)) => {
                let output = truncate_output(&outcome.output);
                let content = format_tool_content(&output, &outcome.message);
                let preview = preview_of(&output);
                // §3 "key_insights: extracted from successful tool outputs" —
                // a tool's `message` is its own short summary of what it did,
                // which is exactly what the compactor wants to retain verbatim.
                let insight = (!outcome.message.is_empty()).then(|| outcome.message.clone());
                (content, true, preview, insight)
            }
            Ok(Err(err)) => self.fail_tool_error(&err, call),
            Err(_) => self.fail(
                &format!("Tool execution timed out after {}s", timeout.as_secs()),
                call,
            ),
        }
    }

    fn fail(&self, reason: &str, _call: &ToolCall) -> (String, bool, String, Option<String>) {
        let content = format!("Tool execution failed: {reason}");
        let preview = preview_of(&content);
        (content, false, preview, None)
    }

    fn fail_tool_error(&self, err: &ToolError, call: &ToolCall) -> (String, bool, String, Option<String>) {
        match err {
            ToolError::Timeout(secs) => self.fail(&format!("timed out after {secs}s"), call),
            other => self.fail(&other.to_string(), call),
        }
    }

    /// Allocates the next synthetic tool-call id for a partial call whose
    /// provider-supplied id hasn't arrived yet (C5 reassembly rules).
    pub fn next_temp_id(&self) -> String {
        format!("temp_{}", self.temp_id_seq.fetch_add(1, Ordering::Relaxed))
    }
}

fn preview_of(text: &str) -> String {
    text.chars().take(OUTPUT_PREVIEW_CHARS).collect()
}

/// Minimal structural validation: every property schemars marks `required`
/// must be present in `args` (§4.4 "(d) required schema fields present").
/// Recurses to bound pathological nesting rather than reject it outright,
/// satisfying the "500 nested levels... no crash" boundary case.
fn validate_required_fields(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    const MAX_DEPTH: usize = 64;
    fn check(schema: &serde_json::Value, args: &serde_json::Value, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err("arguments nested too deeply".to_string());
        }
        let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };
        let Some(obj) = args.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !obj.contains_key(name) {
                return Err(format!("missing required field '{name}'"));
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (name, sub_schema) in props {
                if let Some(value) = obj.get(name) {
                    check(sub_schema, value, depth + 1)?;
                }
            }
        }
        Ok(())
    }
    check(schema, args, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGate;
    use crate::events::ApprovalDecision;
    use crate::message::ToolCall;
    use crate::test_support::NullToolContext;
    use crate::tools::context::{Tool, ToolOutcome};
    use crate::tools::registry::ToolRegistry;
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _call: &ToolCall, _context: &dyn ToolContext) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::with_message("echoed", "recorded a thing"))
        }
    }

    struct AlwaysFailsTool;

    #[async_trait::async_trait]
    impl Tool for AlwaysFailsTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _call: &ToolCall, _context: &dyn ToolContext) -> Result<ToolOutcome, ToolError> {
            Err(ToolError::ExecutionFailed("nope".to_string()))
        }
    }

    struct GatedTool;

    #[async_trait::async_trait]
    impl Tool for GatedTool {
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
        async fn call(&self, _call: &ToolCall, _context: &dyn ToolContext) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::ok("deleted"))
        }
    }

    fn call(id: &str, function_name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            function_name: function_name.to_string(),
            arguments_json_text: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_tool_call_appends_result_and_records_key_insight() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool));
        let dispatcher = Dispatcher::new(registry);
        let bus = EventBus::new();
        let gate = ApprovalGate::yolo();
        let context = Context::new();
        let tool_context = NullToolContext::new("s1");

        let outcome = dispatcher
            .run(&bus, &gate, &context, &tool_context, "s1", &[call("c1", "echo")])
            .await;

        assert!(!outcome.loop_should_terminate);
        assert_eq!(context.len().await, 1);
        assert_eq!(context.key_insights().await, vec!["recorded a thing".to_string()]);
    }

    #[tokio::test]
    async fn three_identical_failures_terminate_the_loop() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(AlwaysFailsTool));
        let dispatcher = Dispatcher::new(registry);
        let bus = EventBus::new();
        let gate = ApprovalGate::yolo();
        let context = Context::new();
        let tool_context = NullToolContext::new("s1");

        for i in 0..2 {
            let outcome = dispatcher
                .run(&bus, &gate, &context, &tool_context, "s1", &[call(&format!("c{i}"), "broken")])
                .await;
            assert!(!outcome.loop_should_terminate);
        }

        let outcome = dispatcher
            .run(&bus, &gate, &context, &tool_context, "s1", &[call("c3", "broken")])
            .await;
        assert!(outcome.loop_should_terminate);

        let history = context.snapshot_history().await;
        assert!(history.last().unwrap().content.as_text().contains("three times in a row"));
    }

    #[tokio::test]
    async fn approval_denial_is_recorded_as_a_failed_result() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(GatedTool));
        let dispatcher = Arc::new(Dispatcher::new(registry));
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(ApprovalGate::new());
        let context = Arc::new(Context::new());
        let tool_context = Arc::new(NullToolContext::new("s1"));

        let d2 = dispatcher.clone();
        let b2 = bus.clone();
        let g2 = gate.clone();
        let c2 = context.clone();
        let t2 = tool_context.clone();
        let handle = tokio::spawn(async move {
            d2.run(&b2, &g2, &c2, t2.as_ref(), "s1", &[call("c1", "rm")]).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.respond_approval("c1", ApprovalDecision::Reject);
        let outcome = handle.await.unwrap();

        assert!(!outcome.loop_should_terminate);
        let history = context.snapshot_history().await;
        assert_eq!(history.last().unwrap().content.as_text(), "Rejected by user");
    }

    #[test]
    fn truncate_output_leaves_short_text_untouched() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn truncate_output_marks_boundary_at_exact_cap() {
        let exact = "a".repeat(OUTPUT_TOTAL_CAP);
        let truncated = truncate_output(&exact);
        assert_eq!(truncated, exact);
        assert!(!truncated.contains(TRUNCATION_MARKER));

        let one_more = "a".repeat(OUTPUT_TOTAL_CAP + 1);
        let truncated = truncate_output(&one_more);
        assert!(truncated.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn truncate_output_caps_individual_lines() {
        let long_line = "x".repeat(OUTPUT_LINE_CAP + 50);
        let truncated = truncate_output(&long_line);
        assert!(truncated.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn format_tool_content_joins_output_and_message() {
        assert_eq!(format_tool_content("out", "msg"), "out\n\nmsg");
        assert_eq!(format_tool_content("out", ""), "out");
        assert_eq!(format_tool_content("", "msg"), "msg");
        assert_eq!(format_tool_content("", ""), "");
    }

    #[test]
    fn error_tracker_flags_three_consecutive_identical_failures() {
        let mut tracker = ErrorTracker::new();
        assert!(!tracker.record_failure("a".into()));
        assert!(!tracker.record_failure("a".into()));
        assert!(tracker.record_failure("a".into()));
    }

    #[test]
    fn error_tracker_resets_on_success() {
        let mut tracker = ErrorTracker::new();
        tracker.record_failure("a".into());
        tracker.record_failure("a".into());
        tracker.record_success();
        assert!(!tracker.record_failure("a".into()));
    }

    #[test]
    fn error_tracker_does_not_flag_mixed_signatures() {
        let mut tracker = ErrorTracker::new();
        tracker.record_failure("a".into());
        tracker.record_failure("b".into());
        assert!(!tracker.record_failure("a".into()));
    }

    #[test]
    fn validate_required_fields_rejects_missing_field() {
        let schema = serde_json::json!({"type": "object", "required": ["path"]});
        let args = serde_json::json!({});
        assert!(validate_required_fields(&schema, &args).is_err());
    }

    #[test]
    fn validate_required_fields_accepts_present_field() {
        let schema = serde_json::json!({"type": "object", "required": ["path"]});
        let args = serde_json::json!({"path": "a.txt"});
        assert!(validate_required_fields(&schema, &args).is_ok());
    }

    #[test]
    fn validate_required_fields_handles_deep_nesting_without_crashing() {
        let mut schema = serde_json::json!({"type": "object"});
        let mut args = serde_json::json!({});
        for _ in 0..600 {
            schema = serde_json::json!({"type": "object", "properties": {"n": schema}});
            args = serde_json::json!({"n": args});
        }
        assert!(validate_required_fields(&schema, &args).is_err());
    }
}

