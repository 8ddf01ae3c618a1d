// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::borrow::Cow;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, Content, RawContent, ResourceContents};
use rmcp::service::{Peer, RoleClient};
use serde_json::Value;
use tracing::debug;

use skald_tools::{PermissionPrompt, Tool, ToolContext, ToolOutput};

/// Namespaced tool name exposed to the model: `mcp__{server}__{tool}`.
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Adapter presenting one remote MCP tool through the local tool contract.
pub struct McpProxyTool {
    name: String,
    description: String,
    schema: Value,
    server: String,
    remote_name: String,
    peer: Peer<RoleClient>,
}

impl McpProxyTool {
    pub fn new(server: &str, tool: rmcp::model::Tool, peer: Peer<RoleClient>) -> Self {
        let remote_name = tool.name.to_string();
        Self {
            name: mcp_tool_name(server, &remote_name),
            description: tool
                .description
                .as_deref()
                .unwrap_or("(no description)")
                .to_string(),
            schema: Value::Object((*tool.input_schema).clone()),
            server: server.to_string(),
            remote_name,
            peer,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    /// External tools are never trusted as read-only: they must pass the
    /// permission engine and run serially.
    fn is_read_only(&self) -> bool {
        false
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        Some(PermissionPrompt {
            title: format!("Use MCP tool {} ({})", self.remote_name, self.server),
            content: serde_json::to_string_pretty(input).unwrap_or_default(),
        })
    }

    fn display_title(&self, _input: &Value) -> String {
        format!("{} ({})", self.remote_name, self.server)
    }

    async fn invoke(&self, input: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        debug!(server = %self.server, tool = %self.remote_name, "calling MCP tool");
        let arguments = match input {
            Value::Object(map) => Some(map.clone()),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                Some(map)
            }
        };
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: Cow::Owned(self.remote_name.clone()),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| anyhow::anyhow!("MCP call failed ({}): {e}", self.server))?;

        let text = render_content(&result.content);
        if result.is_error == Some(true) {
            anyhow::bail!("{text}");
        }
        Ok(ToolOutput::with_data(
            serde_json::to_value(&result.content).unwrap_or(Value::Null),
            text,
        ))
    }
}

/// Flatten an MCP content array into the text fed back to the model.
/// Non-text items are represented by placeholders rather than dropped, so
/// the model knows something was returned.
fn render_content(content: &[Content]) -> String {
    let mut parts = Vec::new();
    for item in content {
        match &**item {
            RawContent::Text(t) => parts.push(t.text.clone()),
            RawContent::Image(i) => parts.push(format!("[image: {}]", i.mime_type)),
            RawContent::Resource(embedded) => {
                let uri = match &embedded.resource {
                    ResourceContents::TextResourceContents { uri, .. } => uri,
                    ResourceContents::BlobResourceContents { uri, .. } => uri,
                };
                parts.push(format!("[resource: {uri}]"));
            }
            _ => parts.push("[unsupported content]".to_string()),
        }
    }
    if parts.is_empty() {
        "(empty result)".to_string()
    } else {
        parts.join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_name_is_namespaced() {
        assert_eq!(mcp_tool_name("filesystem", "read_file"), "mcp__filesystem__read_file");
    }

    #[test]
    fn render_content_joins_text_items() {
        let items = vec![Content::text("one"), Content::text("two")];
        assert_eq!(render_content(&items), "one\ntwo");
    }

    #[test]
    fn render_content_empty_is_placeholder() {
        assert_eq!(render_content(&[]), "(empty result)");
    }
}
