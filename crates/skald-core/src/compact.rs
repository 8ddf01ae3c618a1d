// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use skald_model::{
    collect_stream, AdapterRequest, AssistantMessage, Message, StopReason, ToolSchema, Usage,
};

use crate::agent::{AgentContext, Services};
use crate::constants::{COMPACTION_NOTICE, COMPRESSION_PROMPT, TRUNCATION_NOTICE};

/// Compaction triggers when the latest authoritative input-token count
/// reaches this fraction of the model's context length.
pub const COMPACT_TRIGGER_FRACTION: f64 = 0.75;

/// Truncation fallback aims below this fraction.
const TRUNCATE_TARGET_FRACTION: f64 = 0.5;

/// Histories shorter than this are never compacted.
const MIN_MESSAGES: usize = 3;

/// Token count of the last assistant message with provider-reported usage.
fn last_authoritative_tokens(messages: &[Message]) -> Option<u64> {
    messages.iter().rev().find_map(|m| {
        m.as_assistant()
            .filter(|a| a.usage.is_authoritative())
            .map(|a| a.usage.context_tokens())
    })
}

/// Whether the history needs compaction for the given context length.
pub fn should_compact(messages: &[Message], context_length: u64) -> bool {
    if messages.len() < MIN_MESSAGES || context_length == 0 {
        return false;
    }
    match last_authoritative_tokens(messages) {
        Some(tokens) => tokens as f64 >= context_length as f64 * COMPACT_TRIGGER_FRACTION,
        None => false,
    }
}

/// Compact the history when the threshold is crossed.
///
/// Returns the replacement history, or `None` when no compaction was
/// needed (or every strategy failed, in which case the caller keeps the
/// original messages and continues).
pub async fn compact_if_needed(
    services: &Arc<Services>,
    ctx: &AgentContext,
    messages: &[Message],
) -> Option<Vec<Message>> {
    let profile = services.models.profile_for(ctx.model_pointer)?;
    if !should_compact(messages, profile.context_length) {
        return None;
    }
    compact_now(services, ctx, messages).await
}

/// Compact unconditionally (the `/compact` command path).  The threshold
/// is not consulted; everything else matches [`compact_if_needed`].
pub async fn compact_now(
    services: &Arc<Services>,
    ctx: &AgentContext,
    messages: &[Message],
) -> Option<Vec<Message>> {
    let profile = services.models.profile_for(ctx.model_pointer)?;
    let token_before = last_authoritative_tokens(messages)?;
    debug!(token_before, context_length = profile.context_length, "compacting history");

    // Keep the trailing real user message (the turn being processed) out
    // of the summarized region.
    let (rest, trailing_user) = match messages.last() {
        Some(last @ Message::User(_)) if !last.is_tool_result_message() => {
            (&messages[..messages.len() - 1], Some(last.clone()))
        }
        _ => (messages, None),
    };

    match summarize(services, ctx, rest).await {
        Some(summary) => {
            let token_compact = summary.usage.context_tokens();
            let mut compacted = vec![Message::user_text(COMPACTION_NOTICE), Message::Assistant(summary)];
            compacted.extend(trailing_user);
            emit_compact_event(services, token_before, token_compact, None);
            Some(compacted)
        }
        None => {
            warn!("summarization failed; falling back to truncation");
            let (truncated, token_compact) =
                truncate(messages, token_before, profile.context_length)?;
            emit_compact_event(
                services,
                token_before,
                token_compact,
                Some("summarization failed; history truncated"),
            );
            Some(truncated)
        }
    }
}

/// Run the summarization call.  A dummy `null` tool is attached because
/// some endpoints reject a request whose history contains tool uses but
/// whose tools array is empty; the model is instructed to summarize, not
/// to call it.
async fn summarize(
    services: &Arc<Services>,
    ctx: &AgentContext,
    rest: &[Message],
) -> Option<AssistantMessage> {
    let profile = services.models.profile_for(ctx.model_pointer)?;
    let mut request_messages = rest.to_vec();
    request_messages.push(Message::user_text(COMPRESSION_PROMPT));
    let req = AdapterRequest {
        messages: request_messages,
        system_prompt: Vec::new(),
        tools: vec![ToolSchema {
            name: "null".to_string(),
            description: "Unused placeholder tool. Never call it.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }],
        enable_thinking: false,
        emit_chunks: false,
        temperature: None,
    };
    let provider = services.provider(profile);
    let mut reply = match collect_stream(provider.as_ref(), &req, None, &ctx.cancel).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "compaction model call failed");
            return None;
        }
    };
    let summary_text = reply.text();
    if summary_text.trim().is_empty() {
        return None;
    }
    // Correct the usage: the summarization request carried the whole old
    // history as input, but the summary's footprint in the new history is
    // only its own length.  The corrected count keeps the usage
    // authoritative so the next threshold check works against the shrunken
    // context.
    let summary_tokens = reply
        .usage
        .output_tokens
        .max((summary_text.len() / 4) as u64)
        .max(1);
    reply.usage = Usage {
        input_tokens: summary_tokens,
        output_tokens: 0,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    };
    reply.content.retain(|b| matches!(b, skald_model::ContentBlock::Text { .. }));
    reply.stop_reason = Some(StopReason::EndTurn);
    Some(reply)
}

/// Deterministic fallback: drop the oldest messages until the estimate is
/// below the target fraction, keeping turn boundaries intact.
///
/// Returns `None` when no viable cut exists beyond the last user/assistant
/// pair and even that pair cannot be isolated.
fn truncate(
    messages: &[Message],
    token_before: u64,
    context_length: u64,
) -> Option<(Vec<Message>, u64)> {
    let target = (context_length as f64 * TRUNCATE_TARGET_FRACTION) as u64;

    // Earliest assistant whose prefix removal gets us under the target:
    // an assistant's input tokens approximate the size of everything
    // before it, so dropping through it removes about that many tokens.
    let mut cut_after: Option<(usize, u64)> = None;
    for (i, message) in messages.iter().enumerate() {
        if let Some(assistant) = message.as_assistant() {
            if !assistant.usage.is_authoritative() {
                continue;
            }
            let removed = assistant.usage.context_tokens();
            let remaining = token_before.saturating_sub(removed);
            if remaining <= target {
                cut_after = Some((i, remaining));
                break;
            }
        }
    }

    let (cut_index, token_after) = match cut_after {
        Some(found) => found,
        None => {
            // No measurable cut point: keep the final user/assistant pair.
            let last_user = messages
                .iter()
                .rposition(|m| matches!(m, Message::User(_)) && !m.is_tool_result_message())?;
            let mut kept = vec![Message::user_text(TRUNCATION_NOTICE)];
            kept.extend_from_slice(&messages[last_user..]);
            return Some((kept, 0));
        }
    };

    // Resume at the next real user message so the kept history neither
    // starts with orphaned tool results nor splits a tool-use group.
    let start = messages[cut_index + 1..]
        .iter()
        .position(|m| matches!(m, Message::User(_)) && !m.is_tool_result_message())
        .map(|offset| cut_index + 1 + offset)?;

    let mut kept = vec![Message::user_text(TRUNCATION_NOTICE)];
    kept.extend_from_slice(&messages[start..]);
    Some((kept, token_after))
}

fn emit_compact_event(
    services: &Services,
    token_before: u64,
    token_compact: u64,
    err_msg: Option<&str>,
) {
    let rate = if token_before == 0 {
        0.0
    } else {
        token_compact as f64 / token_before as f64
    };
    let mut payload = json!({
        "tokenBefore": token_before,
        "tokenCompact": token_compact,
        "compactRate": rate,
    });
    if let Some(err) = err_msg {
        payload["errMsg"] = json!(err);
    }
    services.bus.emit("compact:exec", payload);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
