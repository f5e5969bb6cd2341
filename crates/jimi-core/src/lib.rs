//! Agent execution core: the think → call tools → observe → think loop,
//! its context store, tool dispatch, and event bus. LLM transport, tool
//! bodies, config parsing, and UI rendering are external collaborators
//! wired through the traits in [`llm`] and [`tools::context`].

pub mod agent_spec;
pub mod approval;
pub mod compactor;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod executor;
pub mod llm;
pub mod message;
pub mod session;
pub mod stream;
pub mod subagent;
pub mod template;
pub mod tools;

pub mod test_support;

pub use error::AgentError;
pub use events::{Event, EventKind, EventObserver};
