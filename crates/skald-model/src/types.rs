use serde::{Deserialize, Serialize};
use serde_json::Value;

use skald_config::AgentMode;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Model reasoning.  The signature is an opaque integrity blob returned
    /// by some providers; it must be echoed back verbatim and never shown.
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Plain string or a provider-style block array
        /// (`[{type: text|image|resource, …}]`).
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: Value::String(content.into()),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: Value::String(content.into()),
            is_error: true,
        }
    }
}

// ─── Control signals ──────────────────────────────────────────────────────────

/// Instruction carried in a tool result telling the conversation loop to
/// rebuild its context (tool list, system prompt, optionally the message
/// history) before the next model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildContextSignal {
    pub reason: String,
    pub new_mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_message: Option<String>,
}

/// Sum of all cross-cutting side effects a tool may request.  The loop
/// inspects this instead of tools calling back into the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlSignal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_context: Option<RebuildContextSignal>,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_signal: Option<ControlSignal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub uuid: String,
    pub model: String,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub duration_ms: u64,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user_blocks(vec![ContentBlock::text(text)])
    }

    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Self::User(UserMessage {
            content,
            uuid: uuid::Uuid::new_v4().to_string(),
            tool_use_result: None,
            control_signal: None,
        })
    }

    /// User message wrapping a batch of tool results, in tool-use order.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self::User(UserMessage {
            content: blocks,
            uuid: uuid::Uuid::new_v4().to_string(),
            tool_use_result: None,
            control_signal: None,
        })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant(_))
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(a) => Some(a),
            Message::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(u) => Some(u),
            Message::Assistant(_) => None,
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Message::User(u) => &u.content,
            Message::Assistant(a) => &a.content,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn plain_text(&self) -> String {
        self.content()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True for a user message that only carries tool results.
    pub fn is_tool_result_message(&self) -> bool {
        match self {
            Message::User(u) => {
                !u.content.is_empty()
                    && u.content
                        .iter()
                        .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
            }
            Message::Assistant(_) => false,
        }
    }
}

impl AssistantMessage {
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token usage, normalized to one shape at the adapter boundary.  The
/// OpenAI wire names (`prompt_tokens`/`completion_tokens`) are mapped onto
/// these fields before anything downstream sees them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl Usage {
    /// Whether a provider actually reported this usage.  Synthetic messages
    /// (compaction summaries, cache replays, interrupts) carry zeros and are
    /// never authoritative for the context-size calculation.
    pub fn is_authoritative(&self) -> bool {
        self.input_tokens > 0
    }

    /// Total tokens that occupied the context window for the request.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_input_tokens.unwrap_or(0)
            + self.cache_read_input_tokens.unwrap_or(0)
    }
}

/// Normalized stop reason across both wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    /// Map an OpenAI `finish_reason` string onto the canonical set.
    pub fn from_openai(reason: &str) -> Option<Self> {
        match reason {
            "stop" => Some(Self::EndTurn),
            "length" => Some(Self::MaxTokens),
            "tool_calls" => Some(Self::ToolUse),
            "content_filter" => Some(Self::EndTurn),
            _ => None,
        }
    }

    pub fn from_anthropic(reason: &str) -> Option<Self> {
        match reason {
            "end_turn" => Some(Self::EndTurn),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            "tool_use" => Some(Self::ToolUse),
            _ => None,
        }
    }
}

/// Zero out provider usage on every assistant message except the newest
/// authoritative one.  Applied before persistence so a revived session has
/// exactly one authoritative usage record.
pub fn strip_stale_usage(messages: &mut [Message]) {
    let last = messages.iter().rposition(|m| {
        m.as_assistant()
            .map(|a| a.usage.is_authoritative())
            .unwrap_or(false)
    });
    let Some(last) = last else { return };
    for (i, message) in messages.iter_mut().enumerate() {
        if i == last {
            continue;
        }
        if let Message::Assistant(a) = message {
            a.usage = Usage::default();
        }
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Tool definition handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

/// One completion request as seen by a dialect provider.
#[derive(Debug, Clone, Default)]
pub struct AdapterRequest {
    pub messages: Vec<Message>,
    /// System prompt as a list of text blocks.  The anthropic dialect sends
    /// them as separate blocks; the openai dialect concatenates.
    pub system_prompt: Vec<String>,
    pub tools: Vec<ToolSchema>,
    pub enable_thinking: bool,
    /// Governs `message:*:chunk` emission only; the HTTP request always
    /// streams.
    pub emit_chunks: bool,
    pub temperature: Option<f32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_text_constructor_sets_uuid_and_content() {
        let m = Message::user_text("hello");
        assert_eq!(m.plain_text(), "hello");
        assert!(!m.as_user().unwrap().uuid.is_empty());
    }

    #[test]
    fn tool_result_message_detection() {
        let m = Message::tool_results(vec![ContentBlock::tool_result("tu_1", "ok")]);
        assert!(m.is_tool_result_message());
        assert!(!Message::user_text("hi").is_tool_result_message());
    }

    #[test]
    fn mixed_content_is_not_a_tool_result_message() {
        let m = Message::user_blocks(vec![
            ContentBlock::tool_result("tu_1", "ok"),
            ContentBlock::text("and more"),
        ]);
        assert!(!m.is_tool_result_message());
    }

    #[test]
    fn assistant_tool_uses_extracts_ordered_blocks() {
        let a = AssistantMessage {
            content: vec![
                ContentBlock::text("running two tools"),
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "Read".into(),
                    input: json!({"file_path": "/a"}),
                },
                ContentBlock::ToolUse {
                    id: "tu_2".into(),
                    name: "Grep".into(),
                    input: json!({"pattern": "x"}),
                },
            ],
            uuid: "u".into(),
            model: "m".into(),
            usage: Usage::default(),
            stop_reason: Some(StopReason::ToolUse),
            duration_ms: 1,
        };
        let uses = a.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].1, "Read");
        assert_eq!(uses[1].0, "tu_2");
    }

    #[test]
    fn usage_synthetic_detection() {
        assert!(!Usage::default().is_authoritative());
        let real = Usage {
            input_tokens: 100,
            ..Usage::default()
        };
        assert!(real.is_authoritative());
    }

    #[test]
    fn usage_context_tokens_include_cache_fields() {
        let u = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: Some(20),
            cache_read_input_tokens: Some(70),
        };
        assert_eq!(u.context_tokens(), 100);
    }

    #[test]
    fn openai_finish_reason_normalization() {
        assert_eq!(StopReason::from_openai("tool_calls"), Some(StopReason::ToolUse));
        assert_eq!(StopReason::from_openai("length"), Some(StopReason::MaxTokens));
        assert_eq!(StopReason::from_openai("stop"), Some(StopReason::EndTurn));
        assert_eq!(StopReason::from_openai("weird"), None);
    }

    #[test]
    fn message_serializes_with_role_tag() {
        let m = Message::user_text("x");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"][0]["type"], "text");
    }

    #[test]
    fn content_block_round_trip() {
        let b = ContentBlock::ToolUse {
            id: "tu_9".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        };
        let text = serde_json::to_string(&b).unwrap();
        let back: ContentBlock = serde_json::from_str(&text).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn strip_stale_usage_keeps_only_newest_authoritative() {
        let assistant = |input: u64| {
            Message::Assistant(AssistantMessage {
                content: vec![ContentBlock::text("x")],
                uuid: "u".into(),
                model: "m".into(),
                usage: Usage {
                    input_tokens: input,
                    ..Usage::default()
                },
                stop_reason: None,
                duration_ms: 0,
            })
        };
        let mut messages = vec![
            Message::user_text("a"),
            assistant(100),
            Message::user_text("b"),
            assistant(200),
        ];
        strip_stale_usage(&mut messages);
        assert!(!messages[1].as_assistant().unwrap().usage.is_authoritative());
        assert_eq!(messages[3].as_assistant().unwrap().usage.input_tokens, 200);
    }

    #[test]
    fn rebuild_signal_round_trip_uses_camel_case() {
        let sig = ControlSignal {
            rebuild_context: Some(RebuildContextSignal {
                reason: "plan mode exited".into(),
                new_mode: AgentMode::Agent,
                rebuild_message: None,
            }),
        };
        let v = serde_json::to_value(&sig).unwrap();
        assert_eq!(v["rebuildContext"]["newMode"], "agent");
    }
}
