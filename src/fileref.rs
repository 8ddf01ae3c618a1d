// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use skald_core::{AgentContext, Services};

/// Widest window one reference will pull into context.
const MAX_LINES_TO_READ: u64 = 2000;

/// One parsed `@path[:N[-M]]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// The path exactly as typed.
    pub name: String,
    pub start_line: Option<u64>,
    pub end_line: Option<u64>,
}

/// Extract `@` references from user input, deduplicated by first
/// occurrence.
pub fn parse_references(input: &str) -> Vec<FileReference> {
    let pattern = Regex::new(r"@([^\s]+)").expect("static regex");
    let mut seen = Vec::new();
    let mut refs = Vec::new();
    for capture in pattern.captures_iter(input) {
        let raw = capture[1].to_string();
        let parsed = parse_one(&raw);
        if seen.contains(&parsed.name) {
            continue;
        }
        seen.push(parsed.name.clone());
        refs.push(parsed);
    }
    refs
}

/// Split `name[:N[-M]]`.  A suffix that does not parse as a line range is
/// treated as part of the name (paths may legitimately contain colons).
fn parse_one(raw: &str) -> FileReference {
    if let Some((name, range)) = raw.rsplit_once(':') {
        let range_parts: Vec<&str> = range.splitn(2, '-').collect();
        let start = range_parts[0].parse::<u64>().ok();
        if let Some(start) = start {
            let end = range_parts.get(1).and_then(|e| e.parse::<u64>().ok());
            if range_parts.len() == 1 || end.is_some() {
                return FileReference {
                    name: name.to_string(),
                    start_line: Some(start),
                    end_line: end,
                };
            }
        }
    }
    FileReference {
        name: raw.to_string(),
        start_line: None,
        end_line: None,
    }
}

/// Read window computed for a reference, following the reference rules:
/// small ranges read the whole file, oversized ranges center on their
/// midpoint, and rangeless references take the leading window.
fn read_window(reference: &FileReference) -> (Option<u64>, Option<u64>, bool) {
    match (reference.start_line, reference.end_line) {
        (Some(start), Some(end)) => {
            if end <= MAX_LINES_TO_READ {
                (None, None, false)
            } else if end.saturating_sub(start) + 1 > MAX_LINES_TO_READ {
                let mid = (start + end) / 2;
                let offset = mid.saturating_sub(MAX_LINES_TO_READ / 2).max(1);
                (Some(offset), Some(MAX_LINES_TO_READ), false)
            } else {
                (Some(start), Some(end.saturating_sub(start) + 1), false)
            }
        }
        (Some(start), None) => {
            if start <= MAX_LINES_TO_READ {
                (None, None, false)
            } else {
                (Some(start), Some(1), false)
            }
        }
        (None, _) => (Some(1), Some(MAX_LINES_TO_READ), true),
    }
}

/// Resolve every `@` reference in the input: files through the Read tool,
/// directories through Bash `ls`.  Emits one `file:reference` event and
/// returns the `<system-reminder>` blocks describing each tool-call /
/// tool-result pair.
pub async fn build_reference_reminders(
    services: &Arc<Services>,
    ctx: &AgentContext,
    input: &str,
) -> Vec<String> {
    let references = parse_references(input);
    if references.is_empty() {
        return Vec::new();
    }

    let tool_ctx = services.tool_context(ctx);
    let mut reminders = Vec::new();
    let mut emitted = Vec::new();

    for reference in &references {
        let absolute = if Path::new(&reference.name).is_absolute() {
            Path::new(&reference.name).to_path_buf()
        } else {
            services.working_dir.join(&reference.name)
        };

        let is_dir = absolute.is_dir();
        let (kind, rendered) = if is_dir {
            let Some(bash) = ctx.tools.get("Bash") else {
                continue;
            };
            let command = format!("ls \"{}\"", absolute.display());
            let result = bash.invoke(&json!({ "command": command }), &tool_ctx).await;
            let content = match result {
                Ok(out) => out.result_for_assistant,
                Err(e) => format!("Error: {e}"),
            };
            (
                "directory",
                format!(
                    "Called the Bash tool with the following input: {{\"command\":\"{command}\"}}\n\
                     Result of calling the Bash tool:\n{content}"
                ),
            )
        } else {
            let Some(read) = ctx.tools.get("Read") else {
                continue;
            };
            let (offset, limit, truncatable) = read_window(reference);
            let mut read_input = json!({ "file_path": absolute.to_string_lossy() });
            if let Some(offset) = offset {
                read_input["offset"] = json!(offset);
            }
            if let Some(limit) = limit {
                read_input["limit"] = json!(limit);
            }
            let result = read.invoke(&read_input, &tool_ctx).await;
            let content = match result {
                Ok(out) => {
                    let truncated = truncatable
                        && out.data["totalLines"].as_u64().unwrap_or(0) > MAX_LINES_TO_READ;
                    if truncated {
                        format!(
                            "{}\n(File truncated to the first {MAX_LINES_TO_READ} lines.)",
                            out.result_for_assistant
                        )
                    } else {
                        out.result_for_assistant
                    }
                }
                Err(e) => format!("Error: {e}"),
            };
            (
                "file",
                format!(
                    "Called the Read tool with the following input: {read_input}\n\
                     Result of calling the Read tool:\n{content}"
                ),
            )
        };

        debug!(name = %reference.name, kind, "resolved file reference");
        emitted.push(json!({
            "type": kind,
            "name": reference.name,
            "content": rendered.lines().take(3).collect::<Vec<_>>().join("\n"),
        }));
        reminders.push(format!("<system-reminder>\n{rendered}\n</system-reminder>"));
    }

    if !emitted.is_empty() {
        services
            .bus
            .emit("file:reference", json!({ "references": emitted }));
    }
    reminders
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
