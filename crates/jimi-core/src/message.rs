//! Conversation data model (`spec.md` §3): messages, content parts, and tool
//! calls. Grounded in the teacher's `ChatMessage`/`MessageType`/`ToolCall`
//! shape (`querymt::chat`), adapted to the role/content/tool-call triple the
//! spec requires.

use serde::{Deserialize, Serialize};

/// Role of a message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a multi-part message content list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::Image { url: url.into() }
    }

    /// The textual content of this part, empty for non-text parts.
    pub fn as_text(&self) -> &str {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Image { .. } => "",
        }
    }
}

/// Content is either a plain string or an ordered list of content parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    /// Concatenated text across all parts (or the plain string).
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts.iter().map(ContentPart::as_text).collect::<Vec<_>>().join(""),
        }
    }

    pub fn char_len(&self) -> usize {
        self.as_text().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }
}

/// The LLM's structured request to invoke a named tool: `(id, function_name,
/// arguments_json_text)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned opaque id.
    pub id: String,
    pub function_name: String,
    /// JSON document text; schema is the tool's declared input schema.
    pub arguments_json_text: String,
}

impl ToolCall {
    /// `function_name:arguments_json_text`, used as the error-tracker
    /// signature (§4.4 "error-repetition detection").
    pub fn signature(&self) -> String {
        format!("{}:{}", self.function_name, self.arguments_json_text)
    }

    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments_json_text)
    }
}

/// A single immutable message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set only on `role == Tool` messages; back-references the originating
    /// tool call's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: Content::text(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message {
            role: Role::User,
            content: Content::Parts(parts),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: Content::text(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
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

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: Content::text(content),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Rough per-message char count, used by the `⌈total_chars/4⌉` token
    /// estimator (§9 "Token estimation divisor").
    pub fn char_len(&self) -> usize {
        let mut n = self.content.char_len();
        if let Some(calls) = &self.tool_calls {
            for call in calls {
                n += call.function_name.len() + call.arguments_json_text.len();
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_signature_combines_name_and_args() {
        let call = ToolCall {
            id: "c1".into(),
            function_name: "read_file".into(),
            arguments_json_text: r#"{"path":"a.txt"}"#.into(),
        };
        assert_eq!(call.signature(), r#"read_file:{"path":"a.txt"}"#);
    }

    #[test]
    fn content_as_text_joins_parts() {
        let content = Content::Parts(vec![
            ContentPart::text("hello "),
            ContentPart::image("http://x/y.png"),
            ContentPart::text("world"),
        ]);
        assert_eq!(content.as_text(), "hello world");
    }

    #[test]
    fn assistant_with_empty_text_and_tool_calls_still_serializes() {
        let msg = Message::assistant(
            None,
            vec![ToolCall {
                id: "c1".into(),
                function_name: "ls".into(),
                arguments_json_text: "{}".into(),
            }],
        );
        assert!(msg.content.is_empty());
        assert!(msg.tool_calls.is_some());
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::tool_result("c1", "contents");
        let json = serde_json::to_string(&msg).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(restored.content.as_text(), "contents");
    }
}
