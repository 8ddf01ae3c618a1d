// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skald_config::ConfigManager;
use skald_events::{CancelHandle, EventBus};
use skald_model::ControlSignal;
use skald_state::{AgentHandle, StateManager};

/// Model slot a tool-adjacent LLM call should use.  Mirrors the pointer
/// names from the model registry so this crate stays independent of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Main,
    Quick,
}

/// Everything a tool body may touch during one invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub cancel: CancelHandle,
    pub bus: Arc<EventBus>,
    pub state: Arc<StateManager>,
    pub config: Arc<ConfigManager>,
    pub working_dir: PathBuf,
    pub model_tier: ModelTier,
}

impl ToolContext {
    /// Handle onto the calling agent's state partition.
    pub fn agent_state(&self) -> AgentHandle {
        self.state.for_agent(&self.agent_id)
    }
}

/// Tool definition as sent to the model.  Mirrors the model crate's schema
/// type; the conversion happens at the loop boundary.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Structured payload for renderers.
    pub data: Value,
    /// Text fed back to the model as the tool result.
    pub result_for_assistant: String,
    /// Cross-cutting instruction for the conversation loop, if any.
    pub control: Option<ControlSignal>,
}

impl ToolOutput {
    pub fn text(result: impl Into<String>) -> Self {
        let text = result.into();
        Self {
            data: Value::String(text.clone()),
            result_for_assistant: text,
            control: None,
        }
    }

    pub fn with_data(data: Value, result: impl Into<String>) -> Self {
        Self {
            data,
            result_for_assistant: result.into(),
            control: None,
        }
    }

    pub fn with_control(mut self, control: ControlSignal) -> Self {
        self.control = Some(control);
        self
    }
}

/// Permission dialog content for a gated tool call.
#[derive(Debug, Clone)]
pub struct PermissionPrompt {
    pub title: String,
    pub content: String,
}

/// Render of a finished tool call for `tool:execution:complete`.
#[derive(Debug, Clone)]
pub struct ResultRender {
    pub title: String,
    pub summary: String,
    pub content: String,
}

/// The uniform capability contract every tool honors, built-in or
/// MCP-proxied.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;
    /// Read-only tools run concurrently within a batch and skip the
    /// permission engine entirely.
    fn is_read_only(&self) -> bool;

    /// Semantic validation beyond the JSON schema.  An `Err` message goes
    /// back to the model as an error tool result.
    fn validate_input(&self, _input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        Ok(())
    }

    /// Dialog content shown when this call needs user approval.  `None`
    /// falls back to a generic prompt built from the display title.
    fn gen_tool_permission(&self, _input: &Value) -> Option<PermissionPrompt> {
        None
    }

    /// Short human title for this invocation (e.g. the file basename).
    fn display_title(&self, _input: &Value) -> String {
        self.name().to_string()
    }

    /// Render the finished call for UI consumption.
    fn gen_tool_result_message(&self, output: &ToolOutput, input: &Value) -> ResultRender {
        let content = output.result_for_assistant.clone();
        ResultRender {
            title: self.display_title(input),
            summary: content.lines().next().unwrap_or_default().to_string(),
            content,
        }
    }

    /// Execute the tool.  Fallible I/O errors propagate as `Err` and are
    /// converted to error tool results by the runner.
    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct NoopTool;

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            "Noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn is_read_only(&self) -> bool {
            true
        }
        async fn invoke(&self, _input: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::text("done"))
        }
    }

    #[test]
    fn default_display_title_is_tool_name() {
        assert_eq!(NoopTool.display_title(&json!({})), "Noop");
    }

    #[test]
    fn default_result_render_uses_first_line_as_summary() {
        let out = ToolOutput::text("line one\nline two");
        let render = NoopTool.gen_tool_result_message(&out, &json!({}));
        assert_eq!(render.summary, "line one");
        assert_eq!(render.title, "Noop");
    }

    #[test]
    fn default_validation_accepts_anything() {
        // validate_input has a default Ok; exercised through the trait object.
        let tool: &dyn Tool = &NoopTool;
        assert!(tool.gen_tool_permission(&json!({})).is_none());
    }

    #[test]
    fn tool_output_with_control_carries_signal() {
        use skald_model::{ControlSignal, RebuildContextSignal};
        let out = ToolOutput::text("x").with_control(ControlSignal {
            rebuild_context: Some(RebuildContextSignal {
                reason: "r".into(),
                new_mode: skald_config::AgentMode::Agent,
                rebuild_message: None,
            }),
        });
        assert!(out.control.unwrap().rebuild_context.is_some());
    }
}
