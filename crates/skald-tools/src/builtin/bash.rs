// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::tool::{PermissionPrompt, ResultRender, Tool, ToolContext, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TIMEOUT_SECS: u64 = 600;
/// Combined stdout+stderr cap before head/tail trimming.
const MAX_OUTPUT_BYTES: usize = 30_000;

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Executes a shell command in the project working directory and returns its \
         combined stdout and stderr. Commands run under `sh -c` with a timeout \
         (default 120s, max 600s). Avoid interactive commands; they will hang until \
         the timeout. Chain related commands with && rather than issuing them one \
         at a time."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (max 600)"
                },
                "description": {
                    "type": "string",
                    "description": "Short human-readable description of what the command does"
                }
            },
            "required": ["command"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| "missing 'command'".to_string())?;
        if command.trim().is_empty() {
            return Err("command is empty".to_string());
        }
        Ok(())
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        let command = input["command"].as_str()?;
        Some(PermissionPrompt {
            title: "Run shell command".to_string(),
            content: command.to_string(),
        })
    }

    fn display_title(&self, input: &Value) -> String {
        input["command"]
            .as_str()
            .map(|c| {
                let first = c.lines().next().unwrap_or(c);
                if first.len() > 64 {
                    format!("{}…", &first[..64])
                } else {
                    first.to_string()
                }
            })
            .unwrap_or_else(|| self.name().to_string())
    }

    fn gen_tool_result_message(&self, output: &ToolOutput, input: &Value) -> ResultRender {
        let code = output.data["exitCode"].as_i64().unwrap_or(0);
        ResultRender {
            title: self.display_title(input),
            summary: if code == 0 {
                "exit 0".to_string()
            } else {
                format!("exit {code}")
            },
            content: output.result_for_assistant.clone(),
        }
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'command'"))?;
        let timeout = input["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        debug!(command, timeout, "Bash");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout was not piped"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stderr was not piped"))?;

        let cancel = ctx.cancel.clone();
        // kill_on_drop reaps the child on every early-exit path below.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(Duration::from_secs(timeout), async {
                let mut out = Vec::new();
                let mut err = Vec::new();
                let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
                let status = child.wait().await;
                ((out, err), status)
            }) => Some(result),
        };

        let ((out, err), status) = match outcome {
            None => anyhow::bail!("command cancelled"),
            Some(Err(_)) => anyhow::bail!("command timed out after {timeout}s"),
            Some(Ok((io, status))) => (io, status?),
        };

        let mut combined = String::from_utf8_lossy(&out).into_owned();
        let err_text = String::from_utf8_lossy(&err);
        if !err_text.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&err_text);
        }
        if combined.len() > MAX_OUTPUT_BYTES {
            let head = &combined[..MAX_OUTPUT_BYTES / 2];
            let tail = &combined[combined.len() - MAX_OUTPUT_BYTES / 2..];
            combined = format!("{head}\n... [output truncated] ...\n{tail}");
        }
        let exit_code = status.code().unwrap_or(-1);
        let rendered = if combined.trim().is_empty() {
            format!("(no output, exit code {exit_code})")
        } else if exit_code == 0 {
            combined.clone()
        } else {
            format!("{combined}\n(exit code {exit_code})")
        };

        Ok(ToolOutput::with_data(
            json!({ "exitCode": exit_code, "output": combined }),
            rendered,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
