//! Approval gate (C3, `spec.md` §4.3): per-tool-identity allow state, wired
//! to the bus's one-shot `ApprovalRequested`/`respond_approval` channel.
//! Grounded in the teacher's permission-mode handling (session-scoped allow
//! list plus a global "yolo" override) though the teacher splits this across
//! its `permission`/`elicitation` modules; here it is one small state
//! machine since `spec.md` doesn't need per-path or per-resource scoping.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event_bus::EventBus;
use crate::events::ApprovalDecision;
use crate::message::ToolCall;

/// Outcome of gating a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Per-session approval state: tools approved for the rest of the session,
/// plus an optional global bypass ("yolo mode").
pub struct ApprovalGate {
    session_allowed: Mutex<HashSet<String>>,
    yolo: Mutex<bool>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        ApprovalGate {
            session_allowed: Mutex::new(HashSet::new()),
            yolo: Mutex::new(false),
        }
    }

    pub fn yolo() -> Self {
        let gate = Self::new();
        *gate.yolo.lock() = true;
        gate
    }

    pub fn is_yolo(&self) -> bool {
        *self.yolo.lock()
    }

    fn is_session_allowed(&self, function_name: &str) -> bool {
        self.session_allowed.lock().contains(function_name)
    }

    /// Gate a single tool call: returns immediately for yolo mode or a
    /// function already approved for the session; otherwise publishes
    /// `ApprovalRequested` on the bus and blocks for a decision.
    pub async fn gate(
        &self,
        bus: &EventBus,
        session_id: &str,
        tool_call: &ToolCall,
        action_label: &str,
        description: &str,
    ) -> Decision {
        if self.is_yolo() || self.is_session_allowed(&tool_call.function_name) {
            return Decision::Allow;
        }

        let decision = bus
            .request_approval(session_id, &tool_call.id, action_label, description)
            .await;

        match decision {
            ApprovalDecision::Approve => Decision::Allow,
            ApprovalDecision::ApproveSession => {
                self.session_allowed
                    .lock()
                    .insert(tool_call.function_name.clone());
                Decision::Allow
            }
            ApprovalDecision::Reject => Decision::Deny,
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedApprovalGate = Arc<ApprovalGate>;
