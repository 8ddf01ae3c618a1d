// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use skald_config::AgentMode;
use skald_model::{ControlSignal, RebuildContextSignal};

use crate::tool::{Tool, ToolContext, ToolOutput};

/// Choices offered to the user when the model asks to leave Plan mode.
const EXIT_OPTIONS: &[&str] = &["startEditing", "clearContextAndStart"];

pub struct ExitPlanModeTool;

#[async_trait]
impl Tool for ExitPlanModeTool {
    fn name(&self) -> &str {
        "ExitPlanMode"
    }

    fn description(&self) -> &str {
        "Signals that the plan is complete and asks the user how to proceed. Call \
         this once the plan file is ready for implementation. The user chooses to \
         start editing with the current context, or to clear the context and start \
         implementation from the plan alone."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "planFilePath": {
                    "type": "string",
                    "description": "Absolute path of the plan file"
                },
                "planContent": {
                    "type": "string",
                    "description": "Full markdown content of the plan"
                }
            },
            "required": ["planContent"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, _input: &Value, ctx: &ToolContext) -> Result<(), String> {
        if ctx.config.agent_mode() != AgentMode::Plan {
            return Err("ExitPlanMode is only valid while in Plan mode".to_string());
        }
        Ok(())
    }

    fn display_title(&self, _input: &Value) -> String {
        "Exit plan mode".to_string()
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let plan_file_path = input["planFilePath"].as_str().unwrap_or_default();
        let plan_content = input["planContent"].as_str().unwrap_or_default();

        let response = ctx
            .bus
            .request(
                "plan:exit:request",
                "plan:exit:response",
                json!({
                    "agentId": ctx.agent_id,
                    "planFilePath": plan_file_path,
                    "planContent": plan_content,
                    "options": EXIT_OPTIONS,
                }),
                "agentId",
                &ctx.agent_id,
                &ctx.cancel,
            )
            .await;
        let Some(response) = response else {
            anyhow::bail!("plan exit cancelled before the user answered");
        };
        let selected = response["selected"].as_str().unwrap_or("startEditing");
        debug!(selected, "plan mode exit");

        ctx.config.set_agent_mode(AgentMode::Agent);

        let rebuild_message = if selected == "clearContextAndStart" {
            ctx.bus.emit(
                "plan:implement",
                json!({ "planFilePath": plan_file_path, "planContent": plan_content }),
            );
            Some(format!("Implement the following plan:\n\n{plan_content}"))
        } else {
            None
        };

        Ok(ToolOutput::with_data(
            json!({ "selected": selected }),
            "Plan approved. Agent mode is now active; begin the implementation.",
        )
        .with_control(ControlSignal {
            rebuild_context: Some(RebuildContextSignal {
                reason: "plan mode exited".to_string(),
                new_mode: AgentMode::Agent,
                rebuild_message,
            }),
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::context;

    fn plan_ctx(dir: &std::path::Path, selected: &'static str) -> ToolContext {
        let ctx = context(dir);
        ctx.config.set_agent_mode(AgentMode::Plan);
        let bus = Arc::clone(&ctx.bus);
        ctx.bus.on("plan:exit:request", move |payload| {
            let agent = payload["agentId"].as_str().unwrap().to_string();
            bus.emit(
                "plan:exit:response",
                json!({ "agentId": agent, "selected": selected }),
            );
        });
        ctx
    }

    #[tokio::test]
    async fn start_editing_switches_mode_without_rebuild_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = plan_ctx(dir.path(), "startEditing");
        let out = ExitPlanModeTool
            .invoke(
                &json!({"planFilePath": "/proj/plan.md", "planContent": "# Plan"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.config.agent_mode(), AgentMode::Agent);
        let rebuild = out.control.unwrap().rebuild_context.unwrap();
        assert_eq!(rebuild.new_mode, AgentMode::Agent);
        assert!(rebuild.rebuild_message.is_none());
    }

    #[tokio::test]
    async fn clear_context_carries_implement_message_and_event() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = plan_ctx(dir.path(), "clearContextAndStart");
        let implemented = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&implemented);
        ctx.bus.on("plan:implement", move |payload| {
            assert_eq!(payload["planFilePath"], "/proj/plan.md");
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let out = ExitPlanModeTool
            .invoke(
                &json!({"planFilePath": "/proj/plan.md", "planContent": "# The Plan"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(implemented.load(Ordering::SeqCst), 1);
        let rebuild = out.control.unwrap().rebuild_context.unwrap();
        let msg = rebuild.rebuild_message.unwrap();
        assert!(msg.starts_with("Implement the following plan:"));
        assert!(msg.contains("# The Plan"));
    }

    #[tokio::test]
    async fn invalid_outside_plan_mode() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = ExitPlanModeTool
            .validate_input(&json!({"planContent": "x"}), &ctx)
            .unwrap_err();
        assert!(err.contains("Plan mode"));
    }
}
