//! OpenAI-compatible chat-completions transport. This is the one piece
//! `spec.md` explicitly keeps external to the core (§1: "LLM provider
//! transport... only its streaming chunk contract is specified") — the core
//! only defines `LlmProvider`/`ChunkStream`; this module is the thin,
//! swappable implementation the CLI wires in.

use async_trait::async_trait;
use futures::StreamExt;
use jimi_core::error::AgentError;
use jimi_core::events::TokenUsage;
use jimi_core::llm::{ChunkStream, LlmProvider};
use jimi_core::message::{Content, Message, Role};
use jimi_core::stream::LlmChunk;
use jimi_core::tools::ToolSchema;
use tokio::sync::mpsc;

pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub max_context_size: u64,
}

impl LlmConfig {
    /// Reads the three environment variable overrides named in `spec.md`
    /// §6, falling back to sane OpenAI-compatible defaults.
    pub fn from_env(model_override: Option<String>) -> Self {
        LlmConfig {
            api_key: std::env::var("JIMI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("JIMI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model_name: model_override
                .or_else(|| std::env::var("JIMI_MODEL_NAME").ok())
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_context_size: 128_000,
        }
    }
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: LlmConfig) -> Self {
        OpenAiCompatibleProvider {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request_body(&self, system: &str, history: &[Message], tool_schemas: &[ToolSchema], stream: bool) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
        messages.extend(history.iter().map(message_to_wire));

        let mut body = serde_json::json!({
            "model": self.config.model_name,
            "messages": messages,
            "stream": stream,
        });
        if !tool_schemas.is_empty() {
            body["tools"] = serde_json::Value::Array(
                tool_schemas
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": s.name,
                                "description": s.description,
                                "parameters": s.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

fn message_to_wire(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = serde_json::json!({"role": role, "content": message.content.as_text()});
    if let Some(calls) = &message.tool_calls {
        wire["tool_calls"] = serde_json::Value::Array(
            calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.function_name, "arguments": c.arguments_json_text},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = serde_json::Value::String(id.clone());
    }
    wire
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        system: &str,
        history: &[Message],
        tool_schemas: &[ToolSchema],
    ) -> Result<(Message, Option<TokenUsage>), AgentError> {
        let body = self.request_body(system, history, tool_schemas, false);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;

        let choice = json
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| AgentError::Provider("response had no choices".to_string()))?;
        let content = choice
            .pointer("/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let usage = json.get("usage").map(|u| TokenUsage {
            prompt: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            total: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        });

        Ok((
            Message {
                role: Role::Assistant,
                content: Content::text(content),
                tool_calls: None,
                tool_call_id: None,
            },
            usage,
        ))
    }

    async fn stream(
        &self,
        system: &str,
        history: &[Message],
        tool_schemas: &[ToolSchema],
    ) -> Result<Box<dyn ChunkStream>, AgentError> {
        let body = self.request_body(system, history, tool_schemas, true);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_sse(response, tx));
        Ok(Box::new(SseChunkStream { rx }))
    }

    fn max_context_size(&self) -> u64 {
        self.config.max_context_size
    }
}

async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<Result<LlmChunk, AgentError>>) {
    let mut bytes_stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = bytes_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(Err(AgentError::LlmStreamError { reason: e.to_string() })).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            if !handle_sse_event(&event, &tx).await {
                return;
            }
        }
    }
}

/// Returns `false` once `[DONE]` or a fatal parse error has been sent, to
/// tell the caller to stop reading further chunks.
async fn handle_sse_event(event: &str, tx: &mpsc::Sender<Result<LlmChunk, AgentError>>) -> bool {
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        if data == "[DONE]" {
            let _ = tx.send(Ok(LlmChunk::Done { usage: None })).await;
            return false;
        }

        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if let Some(usage) = parsed.get("usage").filter(|u| !u.is_null()) {
            let usage = TokenUsage {
                prompt: usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                completion: usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                total: usage.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            };
            if tx.send(Ok(LlmChunk::Done { usage: Some(usage) })).await.is_err() {
                return false;
            }
            continue;
        }

        let Some(delta) = parsed.pointer("/choices/0/delta") else { continue };

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if tx
                .send(Ok(LlmChunk::Content { text: text.to_string(), is_reasoning: false }))
                .await
                .is_err()
            {
                return false;
            }
        }
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if tx
                .send(Ok(LlmChunk::Content { text: reasoning.to_string(), is_reasoning: true }))
                .await
                .is_err()
            {
                return false;
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let id = call.get("id").and_then(|v| v.as_str()).map(str::to_string);
                let function_name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let arguments_delta = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let chunk = LlmChunk::ToolCall { id, function_name, arguments_delta };
                if tx.send(Ok(chunk)).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

struct SseChunkStream {
    rx: mpsc::Receiver<Result<LlmChunk, AgentError>>,
}

#[async_trait]
impl ChunkStream for SseChunkStream {
    async fn next(&mut self) -> Option<Result<LlmChunk, AgentError>> {
        self.rx.recv().await
    }
}
