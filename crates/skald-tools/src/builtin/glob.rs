// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::builtin::resolve_path;
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Result cap; matches beyond this are reported as a count.
const MAX_RESULTS: usize = 200;

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "Glob"
    }

    fn description(&self) -> &str {
        "Fast file pattern matching. Supports glob patterns like \"**/*.rs\" or \
         \"src/**/*.ts\". Returns matching file paths sorted by modification time, \
         newest first. Use this to locate files by name; use Grep to search content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match against relative file paths"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the working directory)"
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

        let glob = Glob::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid glob pattern '{pattern}': {e}"))?;
        let set = GlobSetBuilder::new().add(glob).build()?;

        // Filesystem walking is synchronous; do it off the async executor.
        let matches = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<(std::path::PathBuf, i64)> = Vec::new();
            for entry in WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
                if set.is_match(rel) {
                    let mtime = crate::builtin::mtime_ms(entry.path()).unwrap_or(0);
                    matches.push((entry.path().to_path_buf(), mtime));
                }
            }
            matches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            matches
        })
        .await?;

        let total = matches.len();
        let mut lines: Vec<String> = matches
            .iter()
            .take(MAX_RESULTS)
            .map(|(p, _)| p.display().to_string())
            .collect();
        if total > MAX_RESULTS {
            lines.push(format!("... ({} more matches omitted)", total - MAX_RESULTS));
        }
        let rendered = if lines.is_empty() {
            "No files found".to_string()
        } else {
            lines.join("\n")
        };

        Ok(ToolOutput::with_data(
            json!({ "pattern": pattern, "matches": total }),
            rendered,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::context;

    #[tokio::test]
    async fn matches_by_extension_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/deep/b.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/readme.md"), "").unwrap();
        let out = GlobTool
            .invoke(&json!({"pattern": "**/*.rs"}), &context(dir.path()))
            .await
            .unwrap();
        assert!(out.result_for_assistant.contains("a.rs"));
        assert!(out.result_for_assistant.contains("b.rs"));
        assert!(!out.result_for_assistant.contains("readme.md"));
        assert_eq!(out.data["matches"], 2);
    }

    #[tokio::test]
    async fn no_match_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = GlobTool
            .invoke(&json!({"pattern": "*.zig"}), &context(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.result_for_assistant, "No files found");
    }

    #[tokio::test]
    async fn invalid_pattern_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = GlobTool
            .invoke(&json!({"pattern": "a{"}), &context(dir.path()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn explicit_path_overrides_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("only_here");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("x.toml"), "").unwrap();
        let out = GlobTool
            .invoke(
                &json!({"pattern": "*.toml", "path": sub.to_str().unwrap()}),
                &context(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.result_for_assistant.contains("x.toml"));
    }
}
