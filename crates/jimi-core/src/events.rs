//! Event taxonomy for the wire (`spec.md` §4.1). Grounded in the teacher's
//! `AgentEvent`/`AgentEventKind`/`EventObserver` shape (`events.rs`),
//! narrowed to the variants `spec.md` names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::message::ToolCall;

/// Why a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneCause {
    Natural,
    MaxSteps,
    Cancelled,
    FatalError,
}

/// Which delta stream a `ContentDelta` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Normal,
    Reasoning,
}

/// An approval decision delivered back through the one-shot reply channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    ApproveSession,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// A single envelope carried on the bus. `seq` is a monotonic, bus-assigned
/// sequence number; events are totally ordered from each subscriber's
/// perspective (`spec.md` §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: i64,
    pub session_id: String,
    pub kind: EventKind,
}

/// The event taxonomy of `spec.md` §4.1.
///
/// `ApprovalRequested` is intentionally not `Serialize`-derivable end to end:
/// its reply channel is a runtime-only `oneshot::Sender`, so it is carried in
/// a side channel rather than the broadcast payload (see `event_bus.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StepBegin { step_no: usize },
    StepInterrupted,
    ContentDelta { text: String, kind: ContentKind },
    ToolCallAnnounce { tool_call: ToolCall },
    /// The reply channel is carried out of band — see
    /// `EventBus::request_approval` / `EventBus::respond_approval`. This
    /// variant only announces the prompt; `tool_call_id` is the correlation
    /// key a subscriber must echo back.
    ApprovalRequested {
        tool_call_id: String,
        action_label: String,
        description: String,
    },
    ToolResult {
        tool_call_id: String,
        ok: bool,
        output_preview: String,
        message: String,
    },
    CompactionBegin,
    CompactionEnd,
    TokenUsage { usage: TokenUsage },
    StepEnd { step_no: usize },
    Done { cause: DoneCause, reason: Option<String> },
    /// Injected by the bus when a subscriber's bounded queue overflows and
    /// the oldest event was dropped (§4.1 backpressure policy).
    SubscriberLagged { n_dropped: u64 },
    Error { message: String },
}

#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<(), AgentError>;
}
