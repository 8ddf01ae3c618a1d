// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! System prompt and reminder assembly.  Reminders are `<system-reminder>`
//! blocks attached to user messages; they never originate from the user
//! and the model is told as much.

use std::path::Path;

use skald_config::{AgentMode, CoreConfig};
use skald_state::TodoItem;

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an interactive agent that helps users with software engineering tasks: \
analyzing codebases, answering questions, writing and modifying code, and running \
commands. Use the tools available to you to take direct action rather than \
describing what the user could do themselves.

Keep responses concise and concrete. When you modify files, read them first. When \
a task needs several steps, track them with the todo tools where available, and \
finish one step before starting the next. Never invent file contents or command \
output; observe them with tools.";

const PLAN_MODE_PROMPT_SUFFIX: &str = "\
You are currently in Plan mode. Research the codebase and iterate on a written \
plan, but do not modify files or run state-changing commands. When the plan is \
complete, call the ExitPlanMode tool to hand it to the user.";

/// Build the system prompt block list for an agent turn.
///
/// The configured override, when present, replaces the built-in prompt but
/// not the environment block.
pub fn build_system_prompt(conf: &CoreConfig, working_dir: &Path) -> Vec<String> {
    let mut blocks = Vec::new();
    match &conf.system_prompt_override {
        Some(custom) => blocks.push(custom.clone()),
        None => {
            blocks.push(DEFAULT_SYSTEM_PROMPT.to_string());
            if conf.agent_mode == AgentMode::Plan {
                blocks.push(PLAN_MODE_PROMPT_SUFFIX.to_string());
            }
        }
    }
    blocks.push(env_block(working_dir));
    blocks
}

/// Environment block appended to every system prompt.
pub fn env_block(working_dir: &Path) -> String {
    format!(
        "Environment:\n- Working directory: {}\n- Platform: {}\n- Date: {}",
        working_dir.display(),
        std::env::consts::OS,
        chrono::Local::now().format("%Y-%m-%d"),
    )
}

/// Current `git status` of the working directory, for subagent prompts.
/// Returns `None` when the directory is not a repository or git is absent.
pub async fn git_status_block(working_dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain=v1", "--branch"])
        .current_dir(working_dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    // Cap to keep pathological repos from flooding the prompt.
    let capped: String = text.lines().take(40).collect::<Vec<_>>().join("\n");
    Some(format!("Current git status:\n{capped}"))
}

/// Fixed notes appended to every subagent system prompt.
pub const SUBAGENT_NOTES: &str = "\
Notes:
- You are a subagent working on one delegated task. Complete the task and report \
the outcome in your final message; that message is returned to the caller verbatim.
- You cannot ask the user questions or spawn further subagents.
- Be thorough but do not exceed the scope of the delegated task.";

fn reminder(text: &str) -> String {
    format!("<system-reminder>\n{text}\n</system-reminder>")
}

/// First-turn todo snapshot, or an empty-list nudge.
pub fn todos_reminder(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        reminder(
            "The todo list is currently empty. If the task at hand needs several \
             steps, record them with TodoWrite before starting. Do not mention this \
             reminder to the user.",
        )
    } else {
        let rendered = serde_json::to_string_pretty(todos).unwrap_or_default();
        reminder(&format!(
            "Current todo list (do not mention this reminder to the user):\n{rendered}"
        ))
    }
}

/// Project and user rules: user-global AGENT.md, project AGENT.md or
/// CLAUDE.md, configured custom rules, and persisted project rules.
pub fn rules_reminder(
    user_rules_file: &Path,
    working_dir: &Path,
    custom_rules: &[String],
    project_rules: &[String],
) -> Option<String> {
    let mut sections = Vec::new();
    if let Ok(text) = std::fs::read_to_string(user_rules_file) {
        if !text.trim().is_empty() {
            sections.push(format!("User rules:\n{}", text.trim()));
        }
    }
    for name in ["AGENT.md", "CLAUDE.md"] {
        if let Ok(text) = std::fs::read_to_string(working_dir.join(name)) {
            if !text.trim().is_empty() {
                sections.push(format!("Project rules ({name}):\n{}", text.trim()));
                break;
            }
        }
    }
    if !custom_rules.is_empty() {
        sections.push(format!("Configured rules:\n- {}", custom_rules.join("\n- ")));
    }
    if !project_rules.is_empty() {
        sections.push(format!("Saved project rules:\n- {}", project_rules.join("\n- ")));
    }
    if sections.is_empty() {
        return None;
    }
    Some(reminder(&format!(
        "The following rules apply to this session. Follow them without mentioning \
         this reminder.\n\n{}",
        sections.join("\n\n")
    )))
}

/// One-shot notice sent on the first query after switching into Plan mode.
pub fn plan_mode_reminder() -> String {
    reminder(
        "Plan mode is active. You may read and analyze, but you must NOT modify \
         files, run state-changing commands, or commit anything. Produce or refine \
         a plan; when it is complete, call ExitPlanMode. Edits are rejected while \
         Plan mode is active.",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
