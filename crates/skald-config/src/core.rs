// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operating mode of the main agent.
///
/// In `Plan` mode edits are soft-disallowed and the model iterates on a plan
/// file; the `ExitPlanMode` tool switches back to `Agent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Agent,
    Plan,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Agent => write!(f, "agent"),
            AgentMode::Plan => write!(f, "plan"),
        }
    }
}

/// Runtime-tunable engine configuration.
///
/// Not persisted — embedders set fields at startup and may mutate individual
/// keys at runtime through [`ConfigManager::update_core_conf_by_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Emit `message:*:chunk` events while streaming.
    pub stream: bool,
    /// Request extended thinking from the model.
    pub enable_thinking: bool,
    /// Replaces the built-in system prompt when set.
    pub system_prompt_override: Option<String>,
    /// Extra rules injected into the first-turn rules reminder.
    pub custom_rules: Vec<String>,
    pub skip_file_edit_permission: bool,
    pub skip_bash_exec_permission: bool,
    pub skip_skill_permission: bool,
    pub skip_mcp_tool_permission: bool,
    pub enable_llm_cache: bool,
    /// When set, only the named built-in tools are offered to the model.
    pub use_tools: Option<Vec<String>>,
    pub agent_mode: AgentMode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            stream: true,
            enable_thinking: false,
            system_prompt_override: None,
            custom_rules: Vec::new(),
            skip_file_edit_permission: false,
            skip_bash_exec_permission: false,
            skip_skill_permission: false,
            skip_mcp_tool_permission: false,
            enable_llm_cache: false,
            use_tools: None,
            agent_mode: AgentMode::Agent,
        }
    }
}

/// Keys writable through [`ConfigManager::update_core_conf_by_key`].
/// Anything else is rejected.
pub const CORE_CONF_KEYS: &[&str] = &[
    "stream",
    "enableThinking",
    "systemPromptOverride",
    "customRules",
    "skipFileEditPermission",
    "skipBashExecPermission",
    "skipSkillPermission",
    "skipMCPToolPermission",
    "enableLLMCache",
    "useTools",
    "agentMode",
];

/// Shared, mutable view of the core configuration.
pub struct ConfigManager {
    conf: RwLock<CoreConfig>,
}

impl ConfigManager {
    pub fn new(conf: CoreConfig) -> Self {
        Self {
            conf: RwLock::new(conf),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> CoreConfig {
        self.conf.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn agent_mode(&self) -> AgentMode {
        self.conf.read().unwrap_or_else(|e| e.into_inner()).agent_mode
    }

    pub fn set_agent_mode(&self, mode: AgentMode) {
        self.conf.write().unwrap_or_else(|e| e.into_inner()).agent_mode = mode;
    }

    /// Apply a closure to the config under the write lock.
    pub fn update<F: FnOnce(&mut CoreConfig)>(&self, f: F) {
        let mut conf = self.conf.write().unwrap_or_else(|e| e.into_inner());
        f(&mut conf);
    }

    /// Write a single key by its wire name.  Only keys in [`CORE_CONF_KEYS`]
    /// are accepted; a type mismatch or unknown key returns an error without
    /// mutating anything.
    pub fn update_core_conf_by_key(&self, key: &str, value: Value) -> anyhow::Result<()> {
        if !CORE_CONF_KEYS.contains(&key) {
            anyhow::bail!("config key '{key}' is not writable");
        }
        let mut conf = self.conf.write().unwrap_or_else(|e| e.into_inner());
        match key {
            "stream" => conf.stream = as_bool(key, &value)?,
            "enableThinking" => conf.enable_thinking = as_bool(key, &value)?,
            "systemPromptOverride" => {
                conf.system_prompt_override = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => anyhow::bail!("'{key}' expects string or null, got {other}"),
                }
            }
            "customRules" => conf.custom_rules = as_string_vec(key, value)?,
            "skipFileEditPermission" => conf.skip_file_edit_permission = as_bool(key, &value)?,
            "skipBashExecPermission" => conf.skip_bash_exec_permission = as_bool(key, &value)?,
            "skipSkillPermission" => conf.skip_skill_permission = as_bool(key, &value)?,
            "skipMCPToolPermission" => conf.skip_mcp_tool_permission = as_bool(key, &value)?,
            "enableLLMCache" => conf.enable_llm_cache = as_bool(key, &value)?,
            "useTools" => {
                conf.use_tools = match value {
                    Value::Null => None,
                    v => Some(as_string_vec(key, v)?),
                }
            }
            "agentMode" => {
                conf.agent_mode = serde_json::from_value(value)
                    .map_err(|e| anyhow::anyhow!("'{key}': {e}"))?
            }
            _ => unreachable!("key checked against CORE_CONF_KEYS"),
        }
        Ok(())
    }
}

fn as_bool(key: &str, value: &Value) -> anyhow::Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| anyhow::anyhow!("'{key}' expects a boolean"))
}

fn as_string_vec(key: &str, value: Value) -> anyhow::Result<Vec<String>> {
    serde_json::from_value(value).map_err(|e| anyhow::anyhow!("'{key}' expects string array: {e}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
