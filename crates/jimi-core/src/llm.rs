//! LLM provider interface (consumed, `spec.md` §6). Only the streaming
//! chunk contract and a minimal non-streaming `complete` are specified; HTTP
//! transport is an external collaborator. Grounded in the teacher's
//! `querymt::chat` trait boundary, narrowed to this core's needs.

use async_trait::async_trait;

use crate::error::AgentError;
use crate::events::TokenUsage;
use crate::message::Message;
use crate::stream::LlmChunk;
use crate::tools::ToolSchema;

/// A live, externally-driven chunk stream. Implementations hand back chunks
/// as they arrive; `next()` returning `None` signals stream end without a
/// `Done` chunk ever having been sent, which the accumulator treats as an
/// abrupt close rather than a protocol violation.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next(&mut self) -> Option<Result<LlmChunk, AgentError>>;
}

/// Consumed LLM provider boundary (§6 "LLM provider interface").
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Non-streaming call used by the compactor (tools disabled).
    async fn complete(
        &self,
        system: &str,
        history: &[Message],
        tool_schemas: &[ToolSchema],
    ) -> Result<(Message, Option<TokenUsage>), AgentError>;

    /// Streaming call used by the main loop.
    async fn stream(
        &self,
        system: &str,
        history: &[Message],
        tool_schemas: &[ToolSchema],
    ) -> Result<Box<dyn ChunkStream>, AgentError>;

    /// Upper bound on context size in tokens, used by the compactor trigger
    /// (§4.8: `token_count > max_context_size - reserved`).
    fn max_context_size(&self) -> u64;
}
