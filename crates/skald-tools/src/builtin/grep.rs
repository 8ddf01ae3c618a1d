// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use globset::Glob;
use regex::RegexBuilder;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::builtin::resolve_path;
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Matching-line cap; results past this are summarized as a count.
const MAX_MATCH_LINES: usize = 200;
/// Files larger than this are skipped (likely binaries or build artifacts).
const MAX_FILE_BYTES: u64 = 5_000_000;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "Grep"
    }

    fn description(&self) -> &str {
        "Searches file contents with a regular expression. Returns matching lines \
         as path:line:content, leading matches first. Restrict the searched files \
         with the glob parameter (e.g. \"*.rs\"). Binary and oversized files are \
         skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the working directory)"
                },
                "glob": {
                    "type": "string",
                    "description": "Only search files whose name matches this glob"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Case-insensitive matching"
                }
            },
            "required": ["pattern"]
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn display_title(&self, input: &Value) -> String {
        input["pattern"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let pattern = input["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'pattern'"))?;
        let base = match input["path"].as_str() {
            Some(p) => resolve_path(ctx, p),
            None => ctx.working_dir.clone(),
        };
        let case_insensitive = input["case_insensitive"].as_bool().unwrap_or(false);
        let name_filter = match input["glob"].as_str() {
            Some(g) => Some(
                Glob::new(g)
                    .map_err(|e| anyhow::anyhow!("invalid glob '{g}': {e}"))?
                    .compile_matcher(),
            ),
            None => None,
        };
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid regex '{pattern}': {e}"))?;

        let (lines, total) = tokio::task::spawn_blocking(move || {
            let mut lines: Vec<String> = Vec::new();
            let mut total = 0usize;
            for entry in WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                    continue;
                }
                if let Some(matcher) = &name_filter {
                    if !matcher.is_match(entry.file_name().to_string_lossy().as_ref()) {
                        continue;
                    }
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    // Not valid UTF-8; treat as binary and skip.
                    continue;
                };
                for (no, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        total += 1;
                        if lines.len() < MAX_MATCH_LINES {
                            lines.push(format!(
                                "{}:{}:{}",
                                entry.path().display(),
                                no + 1,
                                line.trim_end()
                            ));
                        }
                    }
                }
            }
            (lines, total)
        })
        .await?;

        let mut rendered = if lines.is_empty() {
            "No matches found".to_string()
        } else {
            lines.join("\n")
        };
        if total > MAX_MATCH_LINES {
            rendered.push_str(&format!(
                "\n... ({} more matching lines omitted; narrow the pattern)",
                total - MAX_MATCH_LINES
            ));
        }

        Ok(ToolOutput::with_data(
            json!({ "pattern": pattern, "matches": total }),
            rendered,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
