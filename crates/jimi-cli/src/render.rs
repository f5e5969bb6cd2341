//! Terminal rendering: a dedicated subscriber task drains the event bus and
//! writes deltas to stdout, separate from command input so a slow render
//! never blocks the executor (`SPEC_FULL.md` §6 "dedicated subscriber task").

use std::sync::Arc;

use colored::Colorize;
use jimi_core::event_bus::{EventBus, Subscription};
use jimi_core::events::{ApprovalDecision, ContentKind, EventKind};

pub struct RenderTask {
    handle: tokio::task::JoinHandle<()>,
}

impl RenderTask {
    pub async fn stop(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

/// Plain stdout rendering for `jimi run`: no interactive terminal is assumed,
/// so approval prompts auto-deny with a logged warning rather than hanging.
pub fn spawn_plain_renderer(mut sub: Subscription, bus: Arc<EventBus>) -> RenderTask {
    let handle = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match event.kind {
                EventKind::ContentDelta { text, kind: ContentKind::Normal } => {
                    print!("{text}");
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
                EventKind::ContentDelta { text, kind: ContentKind::Reasoning } => {
                    print!("{}", text.dimmed());
                }
                EventKind::ToolCallAnnounce { tool_call } => {
                    println!("\n{} {}", "→".cyan(), tool_call.function_name.bold());
                }
                EventKind::ToolResult { ok, message, .. } if !ok => {
                    println!("{} {}", "✗".red(), message);
                }
                EventKind::ApprovalRequested { tool_call_id, action_label, .. } => {
                    tracing::warn!(
                        tool_call_id,
                        action_label,
                        "approval requested with no interactive terminal attached; denying"
                    );
                    bus.respond_approval(&tool_call_id, ApprovalDecision::Reject);
                }
                EventKind::Error { message } => println!("\n{} {message}", "error:".red().bold()),
                EventKind::Done { .. } => println!(),
                _ => {}
            }
        }
    });
    RenderTask { handle }
}

/// REPL rendering for `jimi chat`: additionally answers `ApprovalRequested`
/// by reading one line from stdin (`allow` / `always` / `deny`).
pub fn spawn_repl_renderer(mut sub: Subscription, bus: Arc<EventBus>) -> RenderTask {
    let handle = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match event.kind {
                EventKind::ContentDelta { text, kind: ContentKind::Normal } => {
                    print!("{text}");
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
                EventKind::ContentDelta { text, kind: ContentKind::Reasoning } => {
                    print!("{}", text.dimmed());
                }
                EventKind::ToolCallAnnounce { tool_call } => {
                    println!("\n{} {}", "→".cyan(), tool_call.function_name.bold());
                }
                EventKind::ToolResult { ok, message, .. } if !ok => {
                    println!("{} {}", "✗".red(), message);
                }
                EventKind::ApprovalRequested { tool_call_id, action_label, description } => {
                    println!(
                        "\n{} {action_label}: {description}\nallow/always/deny?",
                        "approval requested:".yellow().bold()
                    );
                    let decision = read_approval_decision().await;
                    bus.respond_approval(&tool_call_id, decision);
                }
                EventKind::Error { message } => println!("\n{} {message}", "error:".red().bold()),
                EventKind::Done { .. } => println!(),
                _ => {}
            }
        }
    });
    RenderTask { handle }
}

async fn read_approval_decision() -> ApprovalDecision {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if stdin.read_line(&mut line).await.is_err() {
        return ApprovalDecision::Reject;
    }
    match line.trim() {
        "allow" => ApprovalDecision::Approve,
        "always" => ApprovalDecision::ApproveSession,
        _ => ApprovalDecision::Reject,
    }
}
