// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::{basename, edit_after_read_gate, record_read_timestamp, resolve_path};
use crate::tool::{PermissionPrompt, ResultRender, Tool, ToolContext, ToolOutput};

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "Edit"
    }

    fn description(&self) -> &str {
        "Performs an exact string replacement in an existing file. old_string must \
         match the file content exactly, including whitespace, and must be unique \
         unless replace_all is set. The file must have been read with the Read tool \
         in this session, and must not have changed on disk since that read."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to modify"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of requiring uniqueness"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, ctx: &ToolContext) -> Result<(), String> {
        let file_path = input["file_path"]
            .as_str()
            .ok_or_else(|| "missing 'file_path'".to_string())?;
        let path = resolve_path(ctx, file_path);
        if !path.exists() {
            return Err(format!("file does not exist: {}", path.display()));
        }
        if input["old_string"] == input["new_string"] {
            return Err("old_string and new_string are identical".to_string());
        }
        edit_after_read_gate(ctx, &path)
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        let path = input["file_path"].as_str()?;
        Some(PermissionPrompt {
            title: format!("Edit {}", basename(std::path::Path::new(path))),
            content: path.to_string(),
        })
    }

    fn display_title(&self, input: &Value) -> String {
        input["file_path"]
            .as_str()
            .map(|p| basename(std::path::Path::new(p)))
            .unwrap_or_else(|| self.name().to_string())
    }

    fn gen_tool_result_message(&self, output: &ToolOutput, input: &Value) -> ResultRender {
        let replaced = output.data["replacements"].as_u64().unwrap_or(0);
        ResultRender {
            title: self.display_title(input),
            summary: format!("{replaced} replacement(s)"),
            content: output.result_for_assistant.clone(),
        }
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let file_path = input["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'file_path'"))?;
        let old_string = input["old_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'old_string'"))?;
        let new_string = input["new_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'new_string'"))?;
        let replace_all = input["replace_all"].as_bool().unwrap_or(false);

        let path = resolve_path(ctx, file_path);
        let content = tokio::fs::read_to_string(&path).await?;

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            anyhow::bail!(
                "old_string not found in {}. Re-read the file and check the exact text.",
                path.display()
            );
        }
        if occurrences > 1 && !replace_all {
            anyhow::bail!(
                "old_string occurs {occurrences} times in {}. Provide more surrounding \
                 context to make it unique, or set replace_all.",
                path.display()
            );
        }

        let (updated, replacements) = if replace_all {
            (content.replace(old_string, new_string), occurrences)
        } else {
            (content.replacen(old_string, new_string, 1), 1)
        };
        tokio::fs::write(&path, updated).await?;
        record_read_timestamp(ctx, &path);

        debug!(path = %path.display(), replacements, "Edit");
        Ok(ToolOutput::with_data(
            json!({ "filePath": path.to_string_lossy(), "replacements": replacements }),
            format!(
                "Applied {replacements} replacement(s) in {}",
                path.display()
            ),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::context;

    fn setup(content: &str) -> (tempfile::TempDir, ToolContext, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("code.rs");
        std::fs::write(&file, content).unwrap();
        crate::builtin::record_read_timestamp(&ctx, &file);
        (dir, ctx, file)
    }

    #[tokio::test]
    async fn replaces_unique_occurrence() {
        let (_dir, ctx, file) = setup("fn old_name() {}\n");
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "old_name",
            "new_string": "new_name"
        });
        assert!(EditTool.validate_input(&input, &ctx).is_ok());
        EditTool.invoke(&input, &ctx).await.unwrap();
        assert!(std::fs::read_to_string(&file).unwrap().contains("new_name"));
    }

    #[tokio::test]
    async fn ambiguous_match_requires_replace_all() {
        let (_dir, ctx, file) = setup("x = 1; x = 2;\n");
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "x",
            "new_string": "y"
        });
        let err = EditTool.invoke(&input, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("occurs"));
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "x",
            "new_string": "y",
            "replace_all": true
        });
        let out = EditTool.invoke(&input, &ctx).await.unwrap();
        assert_eq!(out.data["replacements"], 2);
    }

    #[tokio::test]
    async fn missing_old_string_is_error() {
        let (_dir, ctx, file) = setup("nothing here\n");
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "ghost",
            "new_string": "spirit"
        });
        let err = EditTool.invoke(&input, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn unread_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("code.rs");
        std::fs::write(&file, "body").unwrap();
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "body",
            "new_string": "text"
        });
        assert!(EditTool.validate_input(&input, &ctx).is_err());
    }

    #[tokio::test]
    async fn nonexistent_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let input = json!({
            "file_path": "/no/such/file.rs",
            "old_string": "a",
            "new_string": "b"
        });
        let err = EditTool.validate_input(&input, &ctx).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[tokio::test]
    async fn identical_strings_fail_validation() {
        let (_dir, ctx, file) = setup("text\n");
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "same",
            "new_string": "same"
        });
        assert!(EditTool.validate_input(&input, &ctx).is_err());
    }

    #[tokio::test]
    async fn successful_edit_refreshes_timestamp() {
        let (_dir, ctx, file) = setup("alpha\n");
        let input = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "alpha",
            "new_string": "beta"
        });
        EditTool.invoke(&input, &ctx).await.unwrap();
        // A second edit against the same file must pass the gate.
        let input2 = json!({
            "file_path": file.to_str().unwrap(),
            "old_string": "beta",
            "new_string": "gamma"
        });
        assert!(EditTool.validate_input(&input2, &ctx).is_ok());
    }
}
