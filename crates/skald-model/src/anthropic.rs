// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ModelError;
use crate::profile::{temperature_for, ModelProfile};
use crate::provider::{drain_sse_lines, sse_data, EventStream, ModelProvider, StreamEvent};
use crate::types::{AdapterRequest, ContentBlock, Message, StopReason, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Token budget requested for extended thinking.  Capped below `max_tokens`
/// so the answer always has room after the reasoning block.
const THINKING_BUDGET_TOKENS: u32 = 4096;

/// Streaming client for the Anthropic Messages wire format.
pub struct AnthropicProvider {
    profile: ModelProfile,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, req: &AdapterRequest) -> Value {
        let messages = build_anthropic_messages(&req.messages, req.enable_thinking);
        let mut body = json!({
            "model": self.profile.model_name,
            "messages": messages,
            "max_tokens": self.profile.max_tokens,
            "stream": true,
        });
        if !req.system_prompt.is_empty() {
            let blocks: Vec<Value> = req
                .system_prompt
                .iter()
                .map(|text| json!({ "type": "text", "text": text }))
                .collect();
            body["system"] = json!(blocks);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if req.enable_thinking {
            let budget = THINKING_BUDGET_TOKENS.min(self.profile.max_tokens.saturating_sub(1024));
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            // The API requires the default temperature when thinking is on.
            body["temperature"] = json!(1.0);
        } else {
            body["temperature"] =
                json!(temperature_for(&self.profile.model_name, req.temperature));
        }
        body
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
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
            thinking = req.enable_thinking,
            "anthropic request"
        );

        let resp = self
            .client
            .post(format!("{base}/v1/messages"))
            .header("x-api-key", &self.profile.api_key)
            .header("anthropic-version", API_VERSION)
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
                            .filter_map(|data| serde_json::from_str::<Value>(data).ok())
                            .flat_map(|v| parse_anthropic_event(&v))
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

/// Map one Anthropic SSE event onto zero or more normalized events.
pub(crate) fn parse_anthropic_event(v: &Value) -> Vec<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = &v["message"]["usage"];
            if usage.is_object() {
                vec![StreamEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                    cache_creation_input_tokens: usage["cache_creation_input_tokens"].as_u64(),
                    cache_read_input_tokens: usage["cache_read_input_tokens"].as_u64(),
                })]
            } else {
                vec![]
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![StreamEvent::ToolUseStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => match delta["text"].as_str() {
                    Some(t) if !t.is_empty() => vec![StreamEvent::TextDelta(t.to_string())],
                    _ => vec![],
                },
                "thinking_delta" => match delta["thinking"].as_str() {
                    Some(t) if !t.is_empty() => vec![StreamEvent::ThinkingDelta(t.to_string())],
                    _ => vec![],
                },
                "signature_delta" => match delta["signature"].as_str() {
                    Some(s) if !s.is_empty() => {
                        vec![StreamEvent::ThinkingSignature(s.to_string())]
                    }
                    _ => vec![],
                },
                "input_json_delta" => match delta["partial_json"].as_str() {
                    Some(p) if !p.is_empty() => vec![StreamEvent::ToolUseDelta {
                        index,
                        partial_json: p.to_string(),
                    }],
                    _ => vec![],
                },
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                if let Some(sr) = StopReason::from_anthropic(reason) {
                    events.push(StreamEvent::StopReason(sr));
                }
            }
            if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                events.push(StreamEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: out,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                }));
            }
            events
        }
        "message_stop" => vec![StreamEvent::Done],
        _ => vec![],
    }
}

/// Convert canonical messages into the Anthropic wire array.
///
/// Thinking blocks are dropped from history when thinking is disabled for
/// this call; when enabled they are forwarded with their signatures so the
/// provider can verify them.
pub(crate) fn build_anthropic_messages(messages: &[Message], thinking: bool) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let (role, blocks) = match message {
            Message::User(u) => ("user", &u.content),
            Message::Assistant(a) => ("assistant", &a.content),
        };
        let content: Vec<Value> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
                ContentBlock::Thinking { text, signature } => {
                    if !thinking {
                        return None;
                    }
                    Some(json!({
                        "type": "thinking",
                        "thinking": text,
                        "signature": signature.clone().unwrap_or_default(),
                    }))
                }
                ContentBlock::ToolUse { id, name, input } => Some(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
            })
            .collect();
        if content.is_empty() {
            continue;
        }
        out.push(json!({ "role": role, "content": content }));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
