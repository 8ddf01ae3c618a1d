// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::{basename, record_read_timestamp, resolve_path};
use crate::tool::{ResultRender, Tool, ToolContext, ToolOutput};

/// Default and maximum line window for one read.
pub const MAX_LINES_TO_READ: usize = 2000;
/// Long lines are cut at this many characters.
const MAX_LINE_LENGTH: usize = 2000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "Read"
    }

    fn description(&self) -> &str {
        "Reads a file from the local filesystem. The file_path must be an absolute path. \
         By default the first 2000 lines are returned; use offset and limit to page \
         through larger files. Lines longer than 2000 characters are truncated. \
         Output lines are prefixed with their 1-indexed line number. \
         Reading a file also unlocks it for the Edit and Write tools."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["file_path"]
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn display_title(&self, input: &Value) -> String {
        input["file_path"]
            .as_str()
            .map(|p| basename(std::path::Path::new(p)))
            .unwrap_or_else(|| self.name().to_string())
    }

    fn gen_tool_result_message(&self, output: &ToolOutput, input: &Value) -> ResultRender {
        let total = output.data["totalLines"].as_u64().unwrap_or(0);
        ResultRender {
            title: self.display_title(input),
            summary: format!("read {total} lines"),
            content: output.result_for_assistant.clone(),
        }
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let file_path = input["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'file_path'"))?;
        let offset = input["offset"].as_u64().map(|v| v.max(1) as usize).unwrap_or(1);
        let limit = input["limit"]
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(MAX_LINES_TO_READ)
            .min(MAX_LINES_TO_READ);

        let path = resolve_path(ctx, file_path);
        debug!(path = %path.display(), offset, limit, "Read");

        let raw = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<&str> = raw.lines().collect();
        let total = lines.len();

        let mut rendered = String::new();
        let start = offset - 1;
        for (i, line) in lines.iter().enumerate().skip(start).take(limit) {
            if line.chars().count() > MAX_LINE_LENGTH {
                let cut: String = line.chars().take(MAX_LINE_LENGTH).collect();
                rendered.push_str(&format!("{:>6}\t{cut}\n", i + 1));
            } else {
                rendered.push_str(&format!("{:>6}\t{line}\n", i + 1));
            }
        }
        let shown = lines.len().min(start + limit).saturating_sub(start);
        if start + shown < total {
            rendered.push_str(&format!(
                "... ({} more lines; continue with offset={})\n",
                total - start - shown,
                start + shown + 1
            ));
        }
        if rendered.is_empty() {
            rendered = "(empty file)".to_string();
        }

        // Unlock the edit gate for this file.
        record_read_timestamp(ctx, &path);

        Ok(ToolOutput::with_data(
            json!({
                "filePath": path.to_string_lossy(),
                "totalLines": total,
                "shownLines": shown,
            }),
            rendered,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
