// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use skald_model::{ContentBlock, Message, ModelPointer};
use skald_tools::{filter_tools, Tool, ToolContext, ToolFilter, ToolOutput, ToolRegistry};

use crate::agent::{query, AgentContext, Services};
use crate::prompts;

/// Configuration of one subagent type.
#[derive(Debug, Clone)]
pub struct SubagentConfig {
    pub name: String,
    pub description: String,
    /// System prompt core; fixed notes and environment are appended.
    pub prompt: String,
    /// Tool names this agent may use; `["*"]` means the full pool.
    pub tools: Vec<String>,
    pub model: ModelPointer,
}

/// Registry of subagent types: the built-in general-purpose agent plus
/// anything the embedder registers (e.g. parsed from agent files, which is
/// outside the engine's scope).
pub struct AgentRegistry {
    configs: RwLock<HashMap<String, SubagentConfig>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let registry = Self {
            configs: RwLock::new(HashMap::new()),
        };
        registry.register(SubagentConfig {
            name: "general-purpose".to_string(),
            description: "General agent for research and multi-step side tasks".to_string(),
            prompt: "You are an agent handling one delegated task end to end. Work \
                     autonomously with the tools you have, verify your findings, and \
                     finish with a single report that fully answers the task."
                .to_string(),
            tools: vec!["*".to_string()],
            model: ModelPointer::Main,
        });
        registry
    }

    pub fn register(&self, config: SubagentConfig) {
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(config.name.to_lowercase(), config);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, subagent_type: &str) -> Option<SubagentConfig> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&subagent_type.to_lowercase())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The `Task` tool: spawn an isolated subagent sharing the parent's
/// cancellation, run it to completion, and return its final report.
pub struct TaskTool {
    registry: Arc<AgentRegistry>,
    /// Set after the service graph is assembled; weak to break the
    /// Services → base_tools → TaskTool → Services cycle.
    services: OnceLock<Weak<Services>>,
}

impl TaskTool {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            services: OnceLock::new(),
        }
    }

    /// Wire the tool to the service graph.  Must be called once before the
    /// first invocation.
    pub fn attach(&self, services: &Arc<Services>) {
        let _ = self.services.set(Arc::downgrade(services));
    }

    fn services(&self) -> anyhow::Result<Arc<Services>> {
        self.services
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("Task tool is not attached to an engine"))
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "Task"
    }

    fn description(&self) -> &str {
        "Launches a subagent to handle a delegated task. The subagent works in an \
         isolated conversation with its own tool set, shares your cancellation, and \
         returns one final report. Use it for self-contained research or multi-step \
         side work whose intermediate steps would only clutter this conversation. \
         Subagents cannot spawn further subagents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Short (3-5 word) description of the task"
                },
                "prompt": {
                    "type": "string",
                    "description": "The full task for the subagent to perform"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "The type of agent to launch"
                }
            },
            "required": ["description", "prompt", "subagent_type"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        let subagent_type = input["subagent_type"]
            .as_str()
            .ok_or_else(|| "missing 'subagent_type'".to_string())?;
        if self.registry.get(subagent_type).is_none() {
            return Err(format!(
                "unknown subagent type '{subagent_type}'; available: {}",
                self.registry.names().join(", ")
            ));
        }
        Ok(())
    }

    fn display_title(&self, input: &Value) -> String {
        input["description"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let services = self.services()?;
        let prompt = input["prompt"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'prompt'"))?;
        let description = input["description"].as_str().unwrap_or_default();
        let subagent_type = input["subagent_type"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'subagent_type'"))?;
        let config = self
            .registry
            .get(subagent_type)
            .ok_or_else(|| anyhow::anyhow!("unknown subagent type '{subagent_type}'"))?;

        let conf = services.config.get();
        let tools = filter_tools(
            &services.base_tools,
            conf.use_tools.as_deref(),
            &services.mcp.tools().await,
            conf.agent_mode,
            ToolFilter::Subagent {
                allowed: &config.tools,
            },
        );

        let mut system_prompt = vec![
            config.prompt.clone(),
            prompts::SUBAGENT_NOTES.to_string(),
            prompts::env_block(&services.working_dir),
        ];
        if let Some(git) = prompts::git_status_block(&services.working_dir).await {
            system_prompt.push(git);
        }

        let agent_id = format!("task-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let sub_ctx = AgentContext {
            agent_id: agent_id.clone(),
            // The parent's handle, shared so one interrupt stops everything.
            cancel: ctx.cancel.clone(),
            tools: tools.clone(),
            model_pointer: config.model,
        };

        let mut blocks = Vec::new();
        if tools.get("TodoWrite").is_some() {
            blocks.push(ContentBlock::text(prompts::todos_reminder(&[])));
        }
        let project_rules = services
            .projects
            .get(&services.working_dir)
            .map(|p| p.rules)
            .unwrap_or_default();
        if let Some(rules) = prompts::rules_reminder(
            &services.paths.root().join("AGENT.md"),
            &services.working_dir,
            &conf.custom_rules,
            &project_rules,
        ) {
            blocks.push(ContentBlock::text(rules));
        }
        blocks.push(ContentBlock::text(prompt));
        let seed = vec![Message::user_blocks(blocks)];

        debug!(task = %agent_id, subagent_type, "spawning subagent");
        services.bus.emit(
            "task:agent:start",
            json!({
                "taskId": agent_id,
                "subagent_type": subagent_type,
                "description": description,
                "prompt": prompt,
            }),
        );

        let started = Instant::now();
        let result = query(&services, &sub_ctx, seed, system_prompt).await;

        let (status, content) = match &result {
            Ok(history) => {
                let stats = HistoryStats::of(history, started);
                if ctx.cancel.is_cancelled() {
                    ("interrupted", format!("Interrupted. {stats}"))
                } else {
                    let report = history
                        .iter()
                        .rev()
                        .find_map(|m| m.as_assistant())
                        .map(|a| a.text())
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| "(subagent produced no output)".to_string());
                    ("completed", report)
                }
            }
            Err(e) => {
                warn!(task = %agent_id, error = %e, "subagent failed");
                let history = services.state.for_agent(&agent_id).get_message_history();
                let stats = HistoryStats::of(&history, started);
                ("failed", format!("Subagent failed: {e}. {stats}"))
            }
        };

        // The partition exists only for the lifetime of the task.
        services.state.for_agent(&agent_id).clear_all_state();

        services.bus.emit(
            "task:agent:end",
            json!({ "taskId": agent_id, "status": status, "content": content }),
        );

        Ok(ToolOutput::with_data(
            json!({ "taskId": agent_id, "status": status }),
            content,
        ))
    }
}

struct HistoryStats {
    tool_use_count: usize,
    input_tokens: u64,
    output_tokens: u64,
    duration_ms: u128,
}

impl HistoryStats {
    fn of(history: &[Message], started: Instant) -> Self {
        let mut tool_use_count = 0;
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        for message in history {
            if let Some(assistant) = message.as_assistant() {
                tool_use_count += assistant.tool_uses().len();
                input_tokens += assistant.usage.context_tokens();
                output_tokens += assistant.usage.output_tokens;
            }
        }
        Self {
            tool_use_count,
            input_tokens,
            output_tokens,
            duration_ms: started.elapsed().as_millis(),
        }
    }
}

impl std::fmt::Display for HistoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({} tool uses, {} input tokens, {} output tokens, {}ms)",
            self.tool_use_count, self.input_tokens, self.output_tokens, self.duration_ms
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
