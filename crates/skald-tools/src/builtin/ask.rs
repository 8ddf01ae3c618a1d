// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct AskUserQuestionTool;

#[async_trait]
impl Tool for AskUserQuestionTool {
    fn name(&self) -> &str {
        "AskUserQuestion"
    }

    fn description(&self) -> &str {
        "Asks the user one or more clarifying questions and waits for their answers. \
         Each question may offer a list of options. Use this when a decision \
         genuinely requires user input; do not ask questions you can answer by \
         inspecting the project."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "description": "Questions to put to the user",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": {"type": "string"},
                            "options": {
                                "type": "array",
                                "items": {"type": "string"}
                            }
                        },
                        "required": ["question"]
                    }
                }
            },
            "required": ["questions"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn display_title(&self, input: &Value) -> String {
        input["questions"][0]["question"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let questions = input["questions"].clone();
        let response = ctx
            .bus
            .request(
                "ask:question:request",
                "ask:question:response",
                json!({ "agentId": ctx.agent_id, "questions": questions }),
                "agentId",
                &ctx.agent_id,
                &ctx.cancel,
            )
            .await;
        let Some(response) = response else {
            anyhow::bail!("question cancelled before the user answered");
        };
        let answers = response.get("answers").cloned().unwrap_or(Value::Null);
        Ok(ToolOutput::with_data(
            json!({ "answers": answers }),
            format!("User answers: {answers}"),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
