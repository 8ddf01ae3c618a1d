// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, warn};

use skald_config::{ConfigManager, ProjectStore};
use skald_events::{CancelHandle, EventBus, REFUSE_REASON};
use skald_model::{
    collect_stream, AdapterRequest, Message, ModelManager, ModelPointer, ModelProfile,
    ModelProvider,
};
use skald_state::StateManager;
use skald_tools::{PermissionPrompt, Tool};

use crate::constants::{
    custom_feedback_message, BASH_PREFIX_PROMPT, CANCEL_MESSAGE, FORBIDDEN_EXECUTABLES,
    REJECT_MESSAGE, SAFE_COMMANDS,
};

/// Constructs the HTTP provider for a profile.  Swappable so tests can
/// route the prefix-extraction call through a scripted mock.
pub type ProviderFactory = Arc<dyn Fn(ModelProfile) -> Arc<dyn ModelProvider> + Send + Sync>;

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allowed,
    /// The denial text becomes the (error) tool result.
    Denied { message: String },
}

/// Result of the LLM-assisted prefix extraction, memoized per exact
/// command string for the lifetime of the engine.
#[derive(Debug, Clone, PartialEq)]
enum PrefixOutcome {
    /// No meaningful prefix; the whole command is the permission key.
    NoPrefix,
    /// The command tries to smuggle something; per-invocation confirmation.
    Injection,
    Prefix(String),
}

enum RequestOutcome {
    Agree,
    Allow,
    Refuse,
    Feedback(String),
    Cancelled,
}

/// Gate for non-read-only tool calls.
pub struct PermissionEngine {
    bus: Arc<EventBus>,
    config: Arc<ConfigManager>,
    state: Arc<StateManager>,
    projects: Arc<ProjectStore>,
    models: Arc<ModelManager>,
    provider_factory: ProviderFactory,
    working_dir: PathBuf,
    prefix_memo: Mutex<HashMap<String, PrefixOutcome>>,
}

const FILE_EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];

impl PermissionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<ConfigManager>,
        state: Arc<StateManager>,
        projects: Arc<ProjectStore>,
        models: Arc<ModelManager>,
        provider_factory: ProviderFactory,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            bus,
            config,
            state,
            projects,
            models,
            provider_factory,
            working_dir,
            prefix_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point: decide whether `tool` may run with `input`.
    pub async fn has_permission(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancelHandle,
        agent_id: &str,
    ) -> PermissionDecision {
        if tool.is_read_only() {
            return PermissionDecision::Allowed;
        }
        let conf = self.config.get();
        let name = tool.name();

        if FILE_EDIT_TOOLS.contains(&name) {
            if conf.skip_file_edit_permission {
                return PermissionDecision::Allowed;
            }
            return self.check_file_edit(tool, input, cancel, agent_id).await;
        }
        if name == "Bash" {
            if conf.skip_bash_exec_permission {
                return PermissionDecision::Allowed;
            }
            return self.check_bash(tool, input, cancel, agent_id).await;
        }
        if name == "Skill" {
            if conf.skip_skill_permission {
                return PermissionDecision::Allowed;
            }
            let skill = input["skill_name"].as_str().unwrap_or_default();
            let key = format!("Skill({skill})");
            return self
                .check_keyed(tool, input, cancel, agent_id, &key)
                .await;
        }
        if name.starts_with("mcp__") {
            if conf.skip_mcp_tool_permission {
                return PermissionDecision::Allowed;
            }
            let key = name.to_string();
            return self
                .check_keyed(tool, input, cancel, agent_id, &key)
                .await;
        }

        // Tools outside the gated classes (TodoWrite, ExitPlanMode, Task,
        // AskUserQuestion) run without prompting.
        PermissionDecision::Allowed
    }

    // ── File-edit class ───────────────────────────────────────────────────────

    async fn check_file_edit(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancelHandle,
        agent_id: &str,
    ) -> PermissionDecision {
        if self.state.global_edit_permission_granted() {
            let path = input["file_path"]
                .as_str()
                .or_else(|| input["notebook_path"].as_str())
                .unwrap_or_default();
            if Path::new(path).starts_with(&self.working_dir) {
                return PermissionDecision::Allowed;
            }
        }
        match self.request(tool, input, cancel, agent_id).await {
            RequestOutcome::Agree => PermissionDecision::Allowed,
            RequestOutcome::Allow => {
                // Session-scoped grant; file edits are never persisted to the
                // project allow-list.
                self.state.grant_global_edit_permission();
                PermissionDecision::Allowed
            }
            other => self.denied(other, cancel),
        }
    }

    // ── Bash class ────────────────────────────────────────────────────────────

    async fn check_bash(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancelHandle,
        agent_id: &str,
    ) -> PermissionDecision {
        let raw = input["command"].as_str().unwrap_or_default();
        let command = normalize_command(raw, &self.working_dir);
        let parts = split_chained(&command);

        for part in &parts {
            if let Some(head) = part.split_whitespace().next() {
                if FORBIDDEN_EXECUTABLES.contains(&head) {
                    return PermissionDecision::Denied {
                        message: format!(
                            "Command '{head}' is not allowed; it cannot be approved interactively."
                        ),
                    };
                }
            }
        }

        let mut missing_keys: Vec<String> = Vec::new();
        let mut injection = false;
        for part in &parts {
            if is_safe_command(part) {
                continue;
            }
            if self
                .projects
                .is_allowed(&self.working_dir, &format!("Bash({part})"))
            {
                continue;
            }
            match self.extract_prefix(part, cancel).await {
                PrefixOutcome::Injection => {
                    injection = true;
                    break;
                }
                PrefixOutcome::Prefix(prefix) => {
                    let key = format!("Bash({prefix}:*)");
                    if !self.projects.is_allowed(&self.working_dir, &key) {
                        missing_keys.push(key);
                    }
                }
                PrefixOutcome::NoPrefix => {
                    missing_keys.push(format!("Bash({part})"));
                }
            }
        }

        if !injection && missing_keys.is_empty() {
            return PermissionDecision::Allowed;
        }

        match self.request(tool, input, cancel, agent_id).await {
            RequestOutcome::Agree => PermissionDecision::Allowed,
            RequestOutcome::Allow => {
                if injection {
                    // Suspicious commands stay per-invocation even when the
                    // user picks "always allow".
                    warn!(command = %command, "not persisting grant for suspected injection");
                } else {
                    for key in &missing_keys {
                        self.projects.allow_tool(&self.working_dir, key);
                    }
                }
                PermissionDecision::Allowed
            }
            other => self.denied(other, cancel),
        }
    }

    /// LLM-assisted prefix extraction via the quick model, memoized by the
    /// exact command string.  The replay cache is intentionally bypassed.
    async fn extract_prefix(&self, command: &str, cancel: &CancelHandle) -> PrefixOutcome {
        if let Some(hit) = self
            .prefix_memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(command)
        {
            return hit.clone();
        }
        let profile = self
            .models
            .profile_for(ModelPointer::Quick)
            .or_else(|| self.models.profile_for(ModelPointer::Main));
        let outcome = match profile {
            None => PrefixOutcome::NoPrefix,
            Some(profile) => {
                let provider = (self.provider_factory)(profile);
                let req = AdapterRequest {
                    messages: vec![Message::user_text(format!(
                        "{BASH_PREFIX_PROMPT}\n{command}"
                    ))],
                    ..AdapterRequest::default()
                };
                match collect_stream(provider.as_ref(), &req, None, cancel).await {
                    Ok(reply) => parse_prefix_reply(&reply.text()),
                    Err(e) => {
                        warn!(error = %e, "prefix extraction failed; falling back to exact key");
                        PrefixOutcome::NoPrefix
                    }
                }
            }
        };
        self.prefix_memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command.to_string(), outcome.clone());
        outcome
    }

    // ── Keyed classes (Skill, MCP) ────────────────────────────────────────────

    async fn check_keyed(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancelHandle,
        agent_id: &str,
        key: &str,
    ) -> PermissionDecision {
        if self.projects.is_allowed(&self.working_dir, key) {
            return PermissionDecision::Allowed;
        }
        match self.request(tool, input, cancel, agent_id).await {
            RequestOutcome::Agree => PermissionDecision::Allowed,
            RequestOutcome::Allow => {
                self.projects.allow_tool(&self.working_dir, key);
                PermissionDecision::Allowed
            }
            other => self.denied(other, cancel),
        }
    }

    // ── Request / response protocol ───────────────────────────────────────────

    async fn request(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancelHandle,
        agent_id: &str,
    ) -> RequestOutcome {
        let prompt = tool.gen_tool_permission(input).unwrap_or_else(|| PermissionPrompt {
            title: tool.display_title(input),
            content: serde_json::to_string_pretty(input).unwrap_or_default(),
        });
        debug!(tool = tool.name(), title = %prompt.title, "requesting permission");
        let response = self
            .bus
            .request(
                "tool:permission:request",
                "tool:permission:response",
                json!({
                    "agentId": agent_id,
                    "toolName": tool.name(),
                    "title": prompt.title,
                    "content": prompt.content,
                    "options": {
                        "agree": "Allow once",
                        "allow": "Always allow",
                        "refuse": "Don't allow",
                    },
                }),
                "toolName",
                tool.name(),
                cancel,
            )
            .await;
        match response {
            None => RequestOutcome::Cancelled,
            Some(v) => match v["selected"].as_str() {
                Some("agree") => RequestOutcome::Agree,
                Some("allow") => RequestOutcome::Allow,
                Some("refuse") => {
                    // The refuse reason lets downstream checkpoints tell a
                    // rejection apart from a plain interrupt.
                    cancel.cancel_with_reason(REFUSE_REASON);
                    RequestOutcome::Refuse
                }
                Some(feedback) => RequestOutcome::Feedback(feedback.to_string()),
                None => RequestOutcome::Cancelled,
            },
        }
    }

    fn denied(&self, outcome: RequestOutcome, cancel: &CancelHandle) -> PermissionDecision {
        match outcome {
            RequestOutcome::Refuse => PermissionDecision::Denied {
                message: REJECT_MESSAGE.to_string(),
            },
            RequestOutcome::Feedback(text) => PermissionDecision::Denied {
                message: custom_feedback_message(&text),
            },
            RequestOutcome::Cancelled => {
                // When a concurrent refusal cancelled us, the refusal owns
                // the outcome.
                if cancel.is_refused() {
                    PermissionDecision::Denied {
                        message: REJECT_MESSAGE.to_string(),
                    }
                } else {
                    PermissionDecision::Denied {
                        message: CANCEL_MESSAGE.to_string(),
                    }
                }
            }
            RequestOutcome::Agree | RequestOutcome::Allow => PermissionDecision::Allowed,
        }
    }
}

/// Strip a leading `cd <working_dir> &&` wrapper.
fn normalize_command(command: &str, working_dir: &Path) -> String {
    let trimmed = command.trim();
    let wd = working_dir.display().to_string();
    for candidate in [
        format!("cd {wd} && "),
        format!("cd \"{wd}\" && "),
        format!("cd '{wd}' && "),
    ] {
        if let Some(rest) = trimmed.strip_prefix(&candidate) {
            return rest.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Split on the shell chaining operators.  Quoting is not interpreted; a
/// quoted `&&` splits too, which errs toward asking rather than allowing.
fn split_chained(command: &str) -> Vec<String> {
    let mut parts = vec![command.to_string()];
    for sep in ["&&", "||", ";"] {
        parts = parts
            .iter()
            .flat_map(|p| p.split(sep).map(str::to_string))
            .collect();
    }
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_safe_command(part: &str) -> bool {
    SAFE_COMMANDS
        .iter()
        .any(|safe| part == *safe || part.starts_with(&format!("{safe} ")))
}

fn parse_prefix_reply(reply: &str) -> PrefixOutcome {
    let line = reply.trim().lines().next().unwrap_or("").trim();
    match line {
        "none" => PrefixOutcome::NoPrefix,
        "command_injection_detected" => PrefixOutcome::Injection,
        "" => PrefixOutcome::NoPrefix,
        prefix => PrefixOutcome::Prefix(prefix.to_string()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
