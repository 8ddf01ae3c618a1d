// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use skald_state::{TodoItem, TodoStatus};

use crate::tool::{ResultRender, Tool, ToolContext, ToolOutput};

pub struct TodoWriteTool;

fn parse_todos(input: &Value) -> Result<Vec<TodoItem>, String> {
    let raw = input["todos"]
        .as_array()
        .ok_or_else(|| "missing 'todos' array".to_string())?;
    let mut todos = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        let todo: TodoItem = serde_json::from_value(item.clone())
            .map_err(|e| format!("todos[{i}]: {e}"))?;
        todos.push(todo);
    }
    Ok(todos)
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "TodoWrite"
    }

    fn description(&self) -> &str {
        "Creates and manages the structured task list for the current session. \
         Each item carries content, a status (pending, in_progress, completed) and \
         an activeForm shown while the item is in progress. At most ONE item may be \
         in_progress at a time. When every submitted item has an id that already \
         exists, the update merges by id; otherwise the whole list is replaced. \
         Mark items completed immediately after finishing them."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The updated todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": {"type": "string"},
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            },
                            "activeForm": {"type": "string"},
                            "id": {"type": "string"}
                        },
                        "required": ["content", "status", "activeForm"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        let todos = parse_todos(input)?;
        let in_progress = todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(format!(
                "{in_progress} items are in_progress; at most one is allowed"
            ));
        }
        Ok(())
    }

    fn gen_tool_result_message(&self, output: &ToolOutput, _input: &Value) -> ResultRender {
        ResultRender {
            title: "Todos".to_string(),
            summary: output.data["summary"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            content: output.result_for_assistant.clone(),
        }
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let todos = parse_todos(input).map_err(|e| anyhow::anyhow!(e))?;
        let counts = (
            todos.iter().filter(|t| t.status == TodoStatus::Completed).count(),
            todos.len(),
        );
        ctx.agent_state().update_todos_intelligently(todos);
        Ok(ToolOutput::with_data(
            json!({ "summary": format!("{}/{} completed", counts.0, counts.1) }),
            "Todos have been modified successfully. Ensure that you continue to use the \
             todo list to track your progress."
                .to_string(),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
