//! Stream accumulator (C5, `spec.md` §4.5). Grounded in the teacher's
//! `StreamChunk` enum (`querymt::chat`), narrowed to the three chunk variants
//! `spec.md` names and reassembled into a `Message` rather than a
//! provider-shaped response type.

use crate::event_bus::EventBus;
use crate::events::{ContentKind, EventKind, TokenUsage};
use crate::message::{Content, Message, Role, ToolCall};

/// One incremental unit from a streaming LLM response (§4.5, §6).
#[derive(Debug, Clone)]
pub enum LlmChunk {
    Content { text: String, is_reasoning: bool },
    ToolCall {
        id: Option<String>,
        function_name: Option<String>,
        arguments_delta: Option<String>,
    },
    Done { usage: Option<TokenUsage> },
}

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: String,
    function_name: Option<String>,
    arguments_json_text: String,
}

/// Reassembles a chunk stream into a complete assistant `Message`,
/// republishing `ContentDelta` as chunks arrive.
pub struct StreamAccumulator {
    content: String,
    finished_calls: Vec<PartialToolCall>,
    current: Option<PartialToolCall>,
    usage: Option<TokenUsage>,
    temp_id_seq: u64,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        StreamAccumulator {
            content: String::new(),
            finished_calls: Vec::new(),
            current: None,
            usage: None,
            temp_id_seq: 0,
        }
    }

    fn next_temp_id(&mut self) -> String {
        let id = format!("temp_{}", self.temp_id_seq);
        self.temp_id_seq += 1;
        id
    }

    fn finalize_current(&mut self) {
        if let Some(call) = self.current.take() {
            self.finished_calls.push(call);
        }
    }

    /// Feed one chunk, publishing `ContentDelta` immediately for `Content`
    /// chunks (§4.5: "no buffering delay").
    pub fn feed(&mut self, bus: &EventBus, session_id: &str, chunk: LlmChunk) {
        match chunk {
            LlmChunk::Content { text, is_reasoning } => {
                self.content.push_str(&text);
                let kind = if is_reasoning {
                    ContentKind::Reasoning
                } else {
                    ContentKind::Normal
                };
                bus.publish(session_id, EventKind::ContentDelta { text, kind });
            }
            LlmChunk::ToolCall {
                id,
                function_name,
                arguments_delta,
            } => self.feed_tool_call(id, function_name, arguments_delta),
            LlmChunk::Done { usage } => {
                self.finalize_current();
                self.usage = usage;
            }
        }
    }

    fn feed_tool_call(
        &mut self,
        id: Option<String>,
        function_name: Option<String>,
        arguments_delta: Option<String>,
    ) {
        match (&mut self.current, id) {
            // A real id different from the current call starts a new one.
            (Some(current), Some(new_id)) if current.id != new_id => {
                // A real id replacing a still-temp id continues the same call
                // in place rather than starting a new one.
                if current.id.starts_with("temp_") && function_name.is_none() {
                    current.id = new_id;
                    if let Some(delta) = arguments_delta {
                        current.arguments_json_text.push_str(&delta);
                    }
                } else {
                    self.finalize_current();
                    self.current = Some(PartialToolCall {
                        id: new_id,
                        function_name,
                        arguments_json_text: arguments_delta.unwrap_or_default(),
                    });
                }
            }
            // Same id: continuation.
            (Some(current), Some(_same_id)) => {
                if let Some(name) = function_name {
                    current.function_name = Some(name);
                }
                if let Some(delta) = arguments_delta {
                    current.arguments_json_text.push_str(&delta);
                }
            }
            // No current call, but a real id arrives: start one.
            (None, Some(new_id)) => {
                self.current = Some(PartialToolCall {
                    id: new_id,
                    function_name,
                    arguments_json_text: arguments_delta.unwrap_or_default(),
                });
            }
            // No id at all: continue the current call, or start a synthetic one.
            (Some(current), None) => {
                if let Some(name) = function_name {
                    current.function_name = Some(name);
                }
                if let Some(delta) = arguments_delta {
                    current.arguments_json_text.push_str(&delta);
                }
            }
            (None, None) => {
                let id = self.next_temp_id();
                self.current = Some(PartialToolCall {
                    id,
                    function_name,
                    arguments_json_text: arguments_delta.unwrap_or_default(),
                });
            }
        }
    }

    /// Finalise the stream into a complete assistant message. Partial calls
    /// missing `function_name` are dropped with a warning and a synthetic
    /// error `ToolResult`; they cannot be executed (§4.5 "Finalisation").
    pub fn finish(mut self, bus: &EventBus, session_id: &str) -> Message {
        self.finalize_current();

        let mut tool_calls = Vec::with_capacity(self.finished_calls.len());
        for call in self.finished_calls {
            match call.function_name {
                Some(function_name) => tool_calls.push(ToolCall {
                    id: call.id,
                    function_name,
                    arguments_json_text: call.arguments_json_text,
                }),
                None => {
                    log::warn!(
                        "dropping partial tool call {} with no function_name",
                        call.id
                    );
                    bus.publish(
                        session_id,
                        EventKind::ToolResult {
                            tool_call_id: call.id,
                            ok: false,
                            output_preview: String::new(),
                            message: "tool call never received a function name".to_string(),
                        },
                    );
                }
            }
        }

        let content = if self.content.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(self.content)
        };

        Message {
            role: Role::Assistant,
            content: Content::text(content.unwrap_or_default()),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
