// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use skald_config::AgentMode;

use crate::tool::{Tool, ToolSchema};

/// Ordered collection of tools.  Registration order is preserved so the
/// model always sees a stable tool list.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Who the filtered tool list is for.
pub enum ToolFilter<'a> {
    MainAgent,
    /// Subagents never get `Task` and are restricted to their configured
    /// tool names (`["*"]` means everything).
    Subagent { allowed: &'a [String] },
}

/// The per-turn tool pipeline: built-ins → `useTools` filter → MCP tools →
/// mode filter → audience filter.
pub fn filter_tools(
    builtins: &ToolRegistry,
    use_tools: Option<&[String]>,
    mcp_tools: &[Arc<dyn Tool>],
    mode: AgentMode,
    audience: ToolFilter<'_>,
) -> ToolRegistry {
    let mut out = ToolRegistry::new();
    for tool in builtins.tools() {
        if let Some(filter) = use_tools {
            if !filter.iter().any(|n| n == tool.name()) {
                continue;
            }
        }
        out.register(Arc::clone(tool));
    }
    for tool in mcp_tools {
        out.register(Arc::clone(tool));
    }

    let mut tools = out.tools.clone();
    if mode == AgentMode::Plan {
        tools.retain(|t| t.name() != "TodoWrite");
    }
    if let ToolFilter::Subagent { allowed } = audience {
        tools.retain(|t| t.name() != "Task");
        if !allowed.iter().any(|a| a == "*") {
            tools.retain(|t| allowed.iter().any(|a| a == t.name()));
        }
    }
    ToolRegistry { tools }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
