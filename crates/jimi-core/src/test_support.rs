//! Test doubles for the agent execution core, mirroring the teacher's
//! `test_utils` module: a scripted `LlmProvider` that replays a fixed chunk
//! sequence, and a minimal `ToolContext` with no filesystem access. Used by
//! `executor`, `dispatcher`, and `subagent` tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::events::TokenUsage;
use crate::llm::{ChunkStream, LlmProvider};
use crate::message::Message;
use crate::stream::LlmChunk;
use crate::tools::context::ToolContext;
use crate::tools::ToolSchema;

/// A pre-scripted sequence of chunks played back verbatim by `ScriptedStream`.
pub struct ScriptedStream {
    chunks: std::collections::VecDeque<LlmChunk>,
}

impl ScriptedStream {
    pub fn new(chunks: Vec<LlmChunk>) -> Self {
        ScriptedStream {
            chunks: chunks.into(),
        }
    }

    pub fn content_only(text: impl Into<String>) -> Self {
        Self::new(vec![
            LlmChunk::Content {
                text: text.into(),
                is_reasoning: false,
            },
            LlmChunk::Done { usage: None },
        ])
    }

    pub fn tool_call(id: &str, function_name: &str, args: &str) -> Self {
        Self::new(vec![
            LlmChunk::ToolCall {
                id: Some(id.to_string()),
                function_name: Some(function_name.to_string()),
                arguments_delta: Some(args.to_string()),
            },
            LlmChunk::Done { usage: None },
        ])
    }

    pub fn empty() -> Self {
        Self::new(vec![LlmChunk::Done { usage: None }])
    }
}

#[async_trait]
impl ChunkStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<LlmChunk, AgentError>> {
        self.chunks.pop_front().map(Ok)
    }
}

/// Replays one `ScriptedStream` per call to `stream()`, in order. Panics if
/// exhausted, since a test that calls it one time too many has a bug in its
/// expected step count, not a legitimate provider failure.
pub struct MockLlmProvider {
    streams: Mutex<std::collections::VecDeque<ScriptedStream>>,
    max_context_size: u64,
    complete_response: Mutex<Option<Message>>,
}

impl MockLlmProvider {
    pub fn with_streams(streams: Vec<ScriptedStream>) -> Self {
        MockLlmProvider {
            streams: Mutex::new(streams.into()),
            max_context_size: 128_000,
            complete_response: Mutex::new(None),
        }
    }

    pub fn with_max_context_size(mut self, size: u64) -> Self {
        self.max_context_size = size;
        self
    }

    pub fn with_complete_response(self, message: Message) -> Self {
        *self.complete_response.lock().unwrap() = Some(message);
        self
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(
        &self,
        _system: &str,
        _history: &[Message],
        _tool_schemas: &[ToolSchema],
    ) -> Result<(Message, Option<TokenUsage>), AgentError> {
        let message = self
            .complete_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Message::assistant(Some("summary".to_string()), vec![]));
        Ok((message, None))
    }

    async fn stream(
        &self,
        _system: &str,
        _history: &[Message],
        _tool_schemas: &[ToolSchema],
    ) -> Result<Box<dyn ChunkStream>, AgentError> {
        let stream = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockLlmProvider: no more scripted streams");
        Ok(Box::new(stream))
    }

    fn max_context_size(&self) -> u64 {
        self.max_context_size
    }
}

/// A `ToolContext` with a fixed session id and the process cwd, no real
/// cancellation wiring. Suitable for tests that never actually cancel.
pub struct NullToolContext {
    session_id: String,
    cwd: PathBuf,
}

impl NullToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        NullToolContext {
            session_id: session_id.into(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[async_trait]
impl ToolContext for NullToolContext {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn cancel_signal(&self) -> tokio_util::sync::CancellationToken {
        tokio_util::sync::CancellationToken::new()
    }
}
