// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ModelError;
use crate::profile::{temperature_for, uses_max_completion_tokens, ModelProfile};
use crate::provider::{drain_sse_lines, sse_data, EventStream, ModelProvider, StreamEvent};
use crate::types::{AdapterRequest, ContentBlock, Message, StopReason, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming client for the OpenAI chat-completions wire format, shared by
/// every OpenAI-compatible endpoint (OpenAI proper, OpenRouter, DeepSeek,
/// local servers, …).
pub struct OpenAiCompatProvider {
    profile: ModelProfile,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, req: &AdapterRequest) -> Value {
        let messages = build_openai_messages(&req.messages, &req.system_prompt, req.enable_thinking);
        let token_key = if uses_max_completion_tokens(&self.profile.model_name) {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        let mut body = json!({
            "model": self.profile.model_name,
            "messages": messages,
            "stream": true,
            token_key: self.profile.max_tokens,
            "stream_options": { "include_usage": true },
            "temperature": temperature_for(&self.profile.model_name, req.temperature),
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if req.enable_thinking {
            // DeepSeek-style endpoints take a thinking object; OpenAI proper
            // takes reasoning_effort.
            if self.profile.provider.contains("deepseek")
                || self.profile.model_name.contains("deepseek")
            {
                body["thinking"] = json!({ "type": "enabled" });
            } else {
                body["reasoning_effort"] = json!("medium");
            }
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    async fn open_stream(&self, req: &AdapterRequest) -> Result<EventStream, ModelError> {
        let base = self
            .profile
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let body = self.request_body(req);

        debug!(
            model = %self.profile.model_name,
            messages = req.messages.len(),
            tools = req.tools.len(),
            "openai-compat request"
        );

        let resp = self
            .client
            .post(format!("{base}/chat/completions"))
            .bearer_auth(&self.profile.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ModelError::from_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, text));
        }

        let stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, ModelError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_lines(buf)
                            .iter()
                            .filter_map(|line| sse_data(line))
                            .flat_map(parse_openai_data)
                            .map(Ok)
                            .collect()
                    }
                    Err(e) => vec![Err(ModelError::Network(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }
}

/// Parse one SSE `data:` payload into normalized events.
pub(crate) fn parse_openai_data(data: &str) -> Vec<StreamEvent> {
    if data == "[DONE]" {
        return vec![StreamEvent::Done];
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    let mut events = Vec::new();

    // Usage-only chunk emitted when stream_options.include_usage is set.
    // prompt_tokens/completion_tokens are normalized here and never leak
    // past the adapter.
    if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
        let cache_read = usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .or_else(|| usage["prompt_cache_hit_tokens"].as_u64());
        events.push(StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: cache_read,
        }));
    }

    let choice = &v["choices"][0];
    if choice.is_null() {
        return events;
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        if let Some(sr) = StopReason::from_openai(reason) {
            events.push(StreamEvent::StopReason(sr));
        }
    }

    let delta = &choice["delta"];
    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            if !id.is_empty() || !name.is_empty() {
                events.push(StreamEvent::ToolUseStart {
                    index,
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
            if let Some(args) = tc["function"]["arguments"].as_str() {
                if !args.is_empty() {
                    events.push(StreamEvent::ToolUseDelta {
                        index,
                        partial_json: args.to_string(),
                    });
                }
            }
        }
    }

    // Reasoning text: `reasoning_content` (DeepSeek, llama.cpp) or
    // `reasoning` (OpenRouter).
    let thinking = delta["reasoning_content"]
        .as_str()
        .or_else(|| delta["reasoning"].as_str());
    if let Some(t) = thinking {
        if !t.is_empty() {
            events.push(StreamEvent::ThinkingDelta(t.to_string()));
        }
    }

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }
    }

    events
}

/// Convert canonical messages into the OpenAI wire array.
///
/// The system prompt blocks are concatenated into a single leading system
/// message.  All tool-use blocks of one assistant turn are emitted as one
/// assistant message with a `tool_calls` array; tool results become `tool`
/// role messages keyed by `tool_call_id`.
pub(crate) fn build_openai_messages(
    messages: &[Message],
    system_prompt: &[String],
    thinking: bool,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({ "role": "system", "content": system_prompt.join("\n\n") }));
    }
    for message in messages {
        match message {
            Message::User(u) => {
                let mut texts = Vec::new();
                for block in &u.content {
                    match block {
                        ContentBlock::Text { text } => texts.push(text.clone()),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let rendered = match content {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            let rendered = if *is_error {
                                format!("Error: {rendered}")
                            } else {
                                rendered
                            };
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": rendered,
                            }));
                        }
                        _ => {}
                    }
                }
                if !texts.is_empty() {
                    out.push(json!({ "role": "user", "content": texts.join("\n") }));
                }
            }
            Message::Assistant(a) => {
                let mut text = String::new();
                let mut reasoning = String::new();
                let mut calls: Vec<Value> = Vec::new();
                for block in &a.content {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::Thinking { text: t, .. } if thinking => {
                            reasoning.push_str(t)
                        }
                        ContentBlock::Thinking { .. } => {}
                        ContentBlock::ToolUse { id, name, input } => calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })),
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                if !reasoning.is_empty() {
                    msg["reasoning_content"] = Value::String(reasoning);
                }
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
