//! Tool registry & dispatcher (C4, `spec.md` §4.4).

pub mod context;
pub mod dispatcher;
pub mod registry;

pub use context::{Tool, ToolContext, ToolError, ToolOutcome};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use registry::{ToolRegistry, ToolSchema};
