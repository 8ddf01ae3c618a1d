// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::time::Instant;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use skald_events::{CancelHandle, EventBus};

use crate::error::ModelError;
use crate::provider::{ModelProvider, StreamEvent};
use crate::types::{AdapterRequest, AssistantMessage, ContentBlock, StopReason, Usage};

struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolUse {
    /// Parse the accumulated argument JSON leniently: a cancelled stream can
    /// leave the buffer truncated mid-object, and the partial message still
    /// has to be representable.  Unparseable input degrades to `{}`.
    fn finish(self) -> Option<ContentBlock> {
        if self.name.is_empty() {
            warn!(tool_use_id = %self.id, "dropping tool use with no name");
            return None;
        }
        let input: Value = if self.args_buf.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|_| {
                warn!(tool = %self.name, "tool-use arguments were not valid JSON; substituting {{}}");
                json!({})
            })
        };
        Some(ContentBlock::ToolUse {
            id: self.id,
            name: self.name,
            input,
        })
    }
}

/// Drive a provider stream to completion and assemble one canonical
/// assistant message.
///
/// Cancellation never errors: the loop breaks at the next event boundary
/// and whatever accumulated so far becomes a partial assistant message.
/// Chunk events are emitted on `bus` only when the request asks for them.
pub async fn collect_stream(
    provider: &dyn ModelProvider,
    req: &AdapterRequest,
    bus: Option<&EventBus>,
    cancel: &CancelHandle,
) -> Result<AssistantMessage, ModelError> {
    let started = Instant::now();
    let mut stream = provider.open_stream(req).await?;

    let mut text = String::new();
    let mut thinking = String::new();
    let mut signature: Option<String> = None;
    let mut pending: BTreeMap<u32, PendingToolUse> = BTreeMap::new();
    let mut usage = Usage::default();
    let mut stop_reason: Option<StopReason> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let event = match event {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(ev)) => ev,
        };
        match event {
            StreamEvent::TextDelta(delta) => {
                text.push_str(&delta);
                if req.emit_chunks {
                    if let Some(bus) = bus {
                        bus.emit(
                            "message:text:chunk",
                            json!({ "content": text, "delta": delta }),
                        );
                    }
                }
            }
            StreamEvent::ThinkingDelta(delta) => {
                thinking.push_str(&delta);
                if req.emit_chunks {
                    if let Some(bus) = bus {
                        bus.emit(
                            "message:thinking:chunk",
                            json!({ "content": thinking, "delta": delta }),
                        );
                    }
                }
            }
            StreamEvent::ThinkingSignature(sig) => {
                signature = Some(match signature.take() {
                    Some(prev) => prev + &sig,
                    None => sig,
                });
            }
            StreamEvent::ToolUseStart { index, id, name } => {
                let entry = pending.entry(index).or_insert_with(|| PendingToolUse {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
            }
            StreamEvent::ToolUseDelta {
                index,
                partial_json,
            } => {
                pending
                    .entry(index)
                    .or_insert_with(|| PendingToolUse {
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    })
                    .args_buf
                    .push_str(&partial_json);
            }
            StreamEvent::Usage(u) => {
                if u.input_tokens > 0 {
                    usage.input_tokens = u.input_tokens;
                }
                if u.output_tokens > 0 {
                    usage.output_tokens = u.output_tokens;
                }
                if u.cache_creation_input_tokens.is_some() {
                    usage.cache_creation_input_tokens = u.cache_creation_input_tokens;
                }
                if u.cache_read_input_tokens.is_some() {
                    usage.cache_read_input_tokens = u.cache_read_input_tokens;
                }
            }
            StreamEvent::StopReason(sr) => stop_reason = Some(sr),
            StreamEvent::Done => break,
        }
    }

    // Assemble content: thinking first, then text, then tool uses in
    // provider index order.
    let mut content = Vec::new();
    if !thinking.is_empty() {
        content.push(ContentBlock::Thinking {
            text: thinking,
            signature,
        });
    }
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    let mut had_tools = false;
    for (i, (_, p)) in pending.into_iter().enumerate() {
        let mut p = p;
        if p.id.is_empty() {
            // Some gateways drop the id frame; synthesize one so the
            // result pairing stays valid on the next request.
            p.id = format!("toolu_synthetic_{i}");
        }
        if let Some(block) = p.finish() {
            had_tools = true;
            content.push(block);
        }
    }

    let stop_reason = stop_reason.or(Some(if had_tools {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    }));

    Ok(AssistantMessage {
        content,
        uuid: uuid::Uuid::new_v4().to_string(),
        model: provider.profile().name.clone(),
        usage,
        stop_reason,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
