// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod ask;
pub mod bash;
pub mod edit;
pub mod glob;
pub mod grep;
pub mod notebook;
pub mod plan;
pub mod read;
pub mod skill;
pub mod todo;
pub mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::tool::{Tool, ToolContext};

pub use ask::AskUserQuestionTool;
pub use bash::BashTool;
pub use edit::EditTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use notebook::NotebookEditTool;
pub use plan::ExitPlanModeTool;
pub use read::ReadTool;
pub use skill::SkillTool;
pub use todo::TodoWriteTool;
pub use write::WriteTool;

/// Register every built-in tool except `Task`, which lives in the core
/// crate because it owns the subagent orchestration.
pub fn register_builtins(reg: &mut ToolRegistry, skills: Arc<skill::SkillRegistry>) {
    reg.register(Arc::new(ReadTool));
    reg.register(Arc::new(WriteTool));
    reg.register(Arc::new(EditTool));
    reg.register(Arc::new(NotebookEditTool));
    reg.register(Arc::new(BashTool));
    reg.register(Arc::new(GlobTool));
    reg.register(Arc::new(GrepTool));
    reg.register(Arc::new(TodoWriteTool));
    reg.register(Arc::new(SkillTool::new(skills)));
    reg.register(Arc::new(AskUserQuestionTool));
    reg.register(Arc::new(ExitPlanModeTool));
}

/// Resolve a tool-supplied path against the working directory.
pub(crate) fn resolve_path(ctx: &ToolContext, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.working_dir.join(p)
    }
}

/// Modification time of a file in epoch milliseconds.
pub(crate) fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let ms = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(ms)
}

/// The edit-after-read gate shared by Write, Edit, and NotebookEdit.
///
/// An existing file may only be modified when the agent has read it and the
/// file has not changed since: the recorded read timestamp must exist and
/// be at least the file's current mtime.  Files being created pass freely.
pub(crate) fn edit_after_read_gate(ctx: &ToolContext, path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    let key = path.to_string_lossy();
    let recorded = ctx.agent_state().get_read_file_timestamp(&key);
    let current = mtime_ms(path).map_err(|e| format!("cannot stat {}: {e}", path.display()))?;
    match recorded {
        None => Err(format!(
            "File {} has not been read in this session. Use the Read tool first, then retry the edit.",
            path.display()
        )),
        Some(ts) if ts < current => Err(format!(
            "File {} was modified after it was last read. Re-read it to pick up the changes, then retry the edit.",
            path.display()
        )),
        Some(_) => Ok(()),
    }
}

/// Record a successful read or write so later edits pass the gate.
pub(crate) fn record_read_timestamp(ctx: &ToolContext, path: &Path) {
    if let Ok(ms) = mtime_ms(path) {
        ctx.agent_state()
            .set_read_file_timestamp(&path.to_string_lossy(), ms);
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
