// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::{basename, edit_after_read_gate, record_read_timestamp, resolve_path};
use crate::tool::{PermissionPrompt, Tool, ToolContext, ToolOutput};

pub struct NotebookEditTool;

#[async_trait]
impl Tool for NotebookEditTool {
    fn name(&self) -> &str {
        "NotebookEdit"
    }

    fn description(&self) -> &str {
        "Edits a Jupyter notebook (.ipynb). Replaces the source of the cell \
         identified by cell_id, inserts a new cell after it, or deletes it, \
         depending on edit_mode. The notebook must have been read in this session \
         and be unchanged on disk since."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "notebook_path": {
                    "type": "string",
                    "description": "Absolute path to the .ipynb file"
                },
                "cell_id": {
                    "type": "string",
                    "description": "Id of the cell to edit (omit to append)"
                },
                "new_source": {
                    "type": "string",
                    "description": "New source for the cell"
                },
                "cell_type": {
                    "type": "string",
                    "enum": ["code", "markdown"],
                    "description": "Cell type when inserting"
                },
                "edit_mode": {
                    "type": "string",
                    "enum": ["replace", "insert", "delete"],
                    "description": "Kind of edit (default replace)"
                }
            },
            "required": ["notebook_path", "new_source"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, ctx: &ToolContext) -> Result<(), String> {
        let path = input["notebook_path"]
            .as_str()
            .ok_or_else(|| "missing 'notebook_path'".to_string())?;
        let resolved = resolve_path(ctx, path);
        if !resolved.exists() {
            return Err(format!("notebook does not exist: {}", resolved.display()));
        }
        edit_after_read_gate(ctx, &resolved)
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        let path = input["notebook_path"].as_str()?;
        Some(PermissionPrompt {
            title: format!("Edit {}", basename(std::path::Path::new(path))),
            content: path.to_string(),
        })
    }

    fn display_title(&self, input: &Value) -> String {
        input["notebook_path"]
            .as_str()
            .map(|p| basename(std::path::Path::new(p)))
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn invoke(&self, input: &Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = resolve_path(
            ctx,
            input["notebook_path"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing 'notebook_path'"))?,
        );
        let new_source = input["new_source"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'new_source'"))?;
        let cell_id = input["cell_id"].as_str();
        let edit_mode = input["edit_mode"].as_str().unwrap_or("replace");
        let cell_type = input["cell_type"].as_str().unwrap_or("code");

        let raw = tokio::fs::read_to_string(&path).await?;
        let mut notebook: Value = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("not a valid notebook: {e}"))?;
        let cells = notebook["cells"]
            .as_array_mut()
            .ok_or_else(|| anyhow::anyhow!("notebook has no cells array"))?;

        let position = match cell_id {
            Some(id) => cells
                .iter()
                .position(|c| c["id"].as_str() == Some(id) || c["metadata"]["id"].as_str() == Some(id)),
            None => None,
        };

        let action = match edit_mode {
            "replace" => {
                let idx = position
                    .ok_or_else(|| anyhow::anyhow!("cell '{}' not found", cell_id.unwrap_or("")))?;
                cells[idx]["source"] = json!(split_source_lines(new_source));
                format!("replaced cell {}", cell_id.unwrap_or(""))
            }
            "insert" => {
                let cell = json!({
                    "cell_type": cell_type,
                    "id": uuid_suffix(),
                    "metadata": {},
                    "source": split_source_lines(new_source),
                    "outputs": [],
                    "execution_count": null,
                });
                let idx = position.map(|p| p + 1).unwrap_or(cells.len());
                cells.insert(idx, cell);
                format!("inserted {cell_type} cell at {idx}")
            }
            "delete" => {
                let idx = position
                    .ok_or_else(|| anyhow::anyhow!("cell '{}' not found", cell_id.unwrap_or("")))?;
                cells.remove(idx);
                format!("deleted cell {}", cell_id.unwrap_or(""))
            }
            other => anyhow::bail!("unknown edit_mode '{other}'"),
        };

        tokio::fs::write(&path, serde_json::to_string_pretty(&notebook)?).await?;
        record_read_timestamp(ctx, &path);

        Ok(ToolOutput::with_data(
            json!({ "notebookPath": path.to_string_lossy(), "action": action }),
            format!("Notebook updated: {action}"),
        ))
    }
}

/// Notebook sources are stored as a list of lines with trailing newlines.
fn split_source_lines(source: &str) -> Vec<String> {
    let mut lines: Vec<String> = source.split_inclusive('\n').map(str::to_string).collect();
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

fn uuid_suffix() -> String {
    // Short ids in the style notebooks use.
    let full = uuid::Uuid::new_v4().to_string();
    full[..8].to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::testutil::context;

    fn notebook_fixture(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("nb.ipynb");
        let nb = json!({
            "cells": [
                {"cell_type": "code", "id": "c1", "metadata": {}, "source": ["print(1)\n"],
                 "outputs": [], "execution_count": null}
            ],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        std::fs::write(&path, serde_json::to_string(&nb).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn replace_cell_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = notebook_fixture(dir.path());
        crate::builtin::record_read_timestamp(&ctx, &path);
        NotebookEditTool
            .invoke(
                &json!({
                    "notebook_path": path.to_str().unwrap(),
                    "cell_id": "c1",
                    "new_source": "print(2)\nprint(3)\n"
                }),
                &ctx,
            )
            .await
            .unwrap();
        let nb: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(nb["cells"][0]["source"][0], "print(2)\n");
        assert_eq!(nb["cells"][0]["source"][1], "print(3)\n");
    }

    #[tokio::test]
    async fn insert_appends_markdown_cell() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = notebook_fixture(dir.path());
        crate::builtin::record_read_timestamp(&ctx, &path);
        NotebookEditTool
            .invoke(
                &json!({
                    "notebook_path": path.to_str().unwrap(),
                    "new_source": "# Notes",
                    "cell_type": "markdown",
                    "edit_mode": "insert"
                }),
                &ctx,
            )
            .await
            .unwrap();
        let nb: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(nb["cells"].as_array().unwrap().len(), 2);
        assert_eq!(nb["cells"][1]["cell_type"], "markdown");
    }

    #[tokio::test]
    async fn delete_removes_cell() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = notebook_fixture(dir.path());
        crate::builtin::record_read_timestamp(&ctx, &path);
        NotebookEditTool
            .invoke(
                &json!({
                    "notebook_path": path.to_str().unwrap(),
                    "cell_id": "c1",
                    "new_source": "",
                    "edit_mode": "delete"
                }),
                &ctx,
            )
            .await
            .unwrap();
        let nb: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(nb["cells"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_cell_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = notebook_fixture(dir.path());
        crate::builtin::record_read_timestamp(&ctx, &path);
        let err = NotebookEditTool
            .invoke(
                &json!({
                    "notebook_path": path.to_str().unwrap(),
                    "cell_id": "ghost",
                    "new_source": "x"
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn unread_notebook_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = notebook_fixture(dir.path());
        let err = NotebookEditTool
            .validate_input(
                &json!({"notebook_path": path.to_str().unwrap(), "new_source": "x"}),
                &ctx,
            )
            .unwrap_err();
        assert!(err.contains("has not been read"));
    }
}
