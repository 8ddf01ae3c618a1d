// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use skald_model::{ContentBlock, RebuildContextSignal};
use skald_tools::{validate_against_schema, Tool, ToolRegistry};

use crate::agent::{AgentContext, Services};
use crate::constants::CANCEL_MESSAGE;
use crate::permission::PermissionDecision;

/// One tool-use block lifted out of an assistant message.
#[derive(Debug, Clone)]
pub struct ToolUseRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Ordered results of one tool batch.
pub struct ToolBatchOutcome {
    /// `tool_result` blocks in the order of the originating tool uses.
    pub blocks: Vec<ContentBlock>,
    /// First rebuild signal produced by any tool in the batch.
    pub rebuild: Option<RebuildContextSignal>,
}

struct SingleOutcome {
    block: ContentBlock,
    rebuild: Option<RebuildContextSignal>,
}

/// Execute a batch of tool uses.
///
/// A batch in which every resolvable tool is read-only runs concurrently;
/// anything else runs serially.  Either way the returned blocks match the
/// input order, so the next user message satisfies the pairing invariant.
pub async fn run_tool_batch(
    services: &Arc<Services>,
    ctx: &AgentContext,
    tools: &ToolRegistry,
    uses: Vec<ToolUseRequest>,
) -> ToolBatchOutcome {
    let all_read_only = uses
        .iter()
        .all(|u| tools.get(&u.name).map(|t| t.is_read_only()).unwrap_or(false));

    let outcomes: Vec<SingleOutcome> = if all_read_only && uses.len() > 1 {
        run_concurrently(services, ctx, tools, uses).await
    } else {
        let mut outcomes = Vec::with_capacity(uses.len());
        for use_ in uses {
            outcomes.push(run_single(services, ctx, tools, use_).await);
        }
        outcomes
    };

    let mut blocks = Vec::with_capacity(outcomes.len());
    let mut rebuild = None;
    for outcome in outcomes {
        if rebuild.is_none() {
            rebuild = outcome.rebuild;
        }
        blocks.push(outcome.block);
    }
    ToolBatchOutcome { blocks, rebuild }
}

async fn run_concurrently(
    services: &Arc<Services>,
    ctx: &AgentContext,
    tools: &ToolRegistry,
    uses: Vec<ToolUseRequest>,
) -> Vec<SingleOutcome> {
    let ids: Vec<String> = uses.iter().map(|u| u.id.clone()).collect();
    let handles: Vec<_> = uses
        .into_iter()
        .map(|use_| {
            let services = Arc::clone(services);
            let ctx = ctx.clone();
            let tools = tools.clone();
            tokio::spawn(async move { run_single(&services, &ctx, &tools, use_).await })
        })
        .collect();
    let mut outcomes = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                outcomes.push(error_outcome(&ids[i], format!("tool task panicked: {e}")))
            }
        }
    }
    outcomes
}

async fn run_single(
    services: &Arc<Services>,
    ctx: &AgentContext,
    tools: &ToolRegistry,
    use_: ToolUseRequest,
) -> SingleOutcome {
    let ToolUseRequest { id, name, input } = use_;
    debug!(agent = %ctx.agent_id, tool = %name, "dispatching tool use");

    // 1. Resolve.
    let Some(tool) = tools.get(&name) else {
        let message = format!("No such tool available: {name}");
        emit_error(services, ctx, &name, &name, &message);
        return error_outcome(&id, message);
    };

    // 2. Structural validation against the declared schema.
    if let Err(message) = validate_against_schema(&input, &tool.input_schema()) {
        emit_error(services, ctx, &name, &tool.display_title(&input), &message);
        return error_outcome(&id, message);
    }

    // 3. Semantic validation.
    if let Err(message) = tool.validate_input(&input, &services.tool_context(ctx)) {
        emit_error(services, ctx, &name, &tool.display_title(&input), &message);
        return error_outcome(&id, message);
    }

    // 4. Checkpoint: cancellation before any side effect.
    if ctx.cancel.is_cancelled() {
        return error_outcome(&id, CANCEL_MESSAGE.to_string());
    }

    // 5. Permission gate for anything that is not read-only.
    if !tool.is_read_only() {
        let decision = services
            .permissions
            .has_permission(tool.as_ref(), &input, &ctx.cancel, &ctx.agent_id)
            .await;
        if let PermissionDecision::Denied { message } = decision {
            // The engine already distinguishes refusal, feedback, and plain
            // cancellation in the message; return it verbatim.
            return error_outcome(&id, message);
        }
    }

    // 6. Invoke the body.
    let result = tool.invoke(&input, &services.tool_context(ctx)).await;

    // 7. Checkpoint: cancellation during execution.  A refusal keeps the
    //    original result so REJECT_MESSAGE is not masked.
    if ctx.cancel.is_cancelled() && !ctx.cancel.is_refused() {
        return error_outcome(&id, CANCEL_MESSAGE.to_string());
    }

    match result {
        Ok(output) => {
            let render = tool.gen_tool_result_message(&output, &input);
            services.bus.emit(
                "tool:execution:complete",
                json!({
                    "agentId": ctx.agent_id,
                    "toolName": name,
                    "title": render.title,
                    "summary": render.summary,
                    "content": render.content,
                }),
            );
            SingleOutcome {
                block: ContentBlock::tool_result(&id, output.result_for_assistant.clone()),
                rebuild: output.control.and_then(|c| c.rebuild_context),
            }
        }
        Err(e) => {
            let message = trim_error(&e.to_string());
            warn!(tool = %name, error = %message, "tool execution failed");
            emit_error(services, ctx, &name, &tool.display_title(&input), &message);
            error_outcome(&id, message)
        }
    }
}

fn error_outcome(tool_use_id: &str, message: String) -> SingleOutcome {
    SingleOutcome {
        block: ContentBlock::tool_error(tool_use_id, message),
        rebuild: None,
    }
}

fn emit_error(services: &Services, ctx: &AgentContext, tool: &str, title: &str, content: &str) {
    services.bus.emit(
        "tool:execution:error",
        json!({
            "agentId": ctx.agent_id,
            "toolName": tool,
            "title": title,
            "content": content,
        }),
    );
}

/// Cap an error string at 10 000 characters, keeping head and tail.
pub(crate) fn trim_error(message: &str) -> String {
    const MAX: usize = 10_000;
    if message.len() <= MAX {
        return message.to_string();
    }
    let head: String = message.chars().take(MAX / 2).collect();
    let tail_chars: Vec<char> = message.chars().collect();
    let tail: String = tail_chars[tail_chars.len() - MAX / 2..].iter().collect();
    format!("{head}\n... [error truncated] ...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
