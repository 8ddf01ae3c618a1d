// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::{basename, edit_after_read_gate, record_read_timestamp, resolve_path};
use crate::tool::{PermissionPrompt, ResultRender, Tool, ToolContext, ToolOutput};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "Write"
    }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem, overwriting any existing content. \
         To overwrite an existing file you must have read it first with the Read \
         tool in this session. Parent directories are created as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, ctx: &ToolContext) -> Result<(), String> {
        let file_path = input["file_path"]
            .as_str()
            .ok_or_else(|| "missing 'file_path'".to_string())?;
        edit_after_read_gate(ctx, &resolve_path(ctx, file_path))
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        let path = input["file_path"].as_str()?;
        Some(PermissionPrompt {
            title: format!("Write {}", basename(std::path::Path::new(path))),
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
        let bytes = output.data["bytes"].as_u64().unwrap_or(0);
        ResultRender {
            title: self.display_title(input),
            summary: format!("wrote {bytes} bytes"),
            content: output.result_for_assistant.clone(),
        }
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let file_path = input["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'file_path'"))?;
        let content = input["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'content'"))?;

        let path = resolve_path(ctx, file_path);
        debug!(path = %path.display(), bytes = content.len(), "Write");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        record_read_timestamp(ctx, &path);

        Ok(ToolOutput::with_data(
            json!({ "filePath": path.to_string_lossy(), "bytes": content.len() }),
            format!("File written: {}", path.display()),
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
    async fn writes_new_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("deep/nested/out.txt");
        let input = json!({"file_path": file.to_str().unwrap(), "content": "hello"});
        assert!(WriteTool.validate_input(&input, &ctx).is_ok(), "new files need no prior read");
        WriteTool.invoke(&input, &ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hello");
    }

    #[tokio::test]
    async fn overwrite_without_read_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("exists.txt");
        std::fs::write(&file, "original").unwrap();
        let input = json!({"file_path": file.to_str().unwrap(), "content": "clobber"});
        let err = WriteTool.validate_input(&input, &ctx).unwrap_err();
        assert!(err.contains("has not been read"));
    }

    #[tokio::test]
    async fn overwrite_after_read_passes_gate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("exists.txt");
        std::fs::write(&file, "original").unwrap();
        crate::builtin::record_read_timestamp(&ctx, &file);
        let input = json!({"file_path": file.to_str().unwrap(), "content": "new"});
        assert!(WriteTool.validate_input(&input, &ctx).is_ok());
        WriteTool.invoke(&input, &ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "new");
    }

    #[tokio::test]
    async fn stale_read_timestamp_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = dir.path().join("exists.txt");
        std::fs::write(&file, "v1").unwrap();
        // Recorded read older than the file's mtime.
        ctx.agent_state()
            .set_read_file_timestamp(&file.to_string_lossy(), 1);
        let input = json!({"file_path": file.to_str().unwrap(), "content": "v2"});
        let err = WriteTool.validate_input(&input, &ctx).unwrap_err();
        assert!(err.contains("modified after"));
    }

    #[test]
    fn permission_prompt_names_the_file() {
        let prompt = WriteTool
            .gen_tool_permission(&json!({"file_path": "/proj/main.rs"}))
            .unwrap();
        assert_eq!(prompt.title, "Write main.rs");
        assert_eq!(prompt.content, "/proj/main.rs");
    }
}
