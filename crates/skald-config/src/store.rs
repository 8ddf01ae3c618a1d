// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Filesystem layout of the engine's persisted state.
///
/// Everything lives under a single data root so that tests can point the
/// whole engine at a temporary directory with [`EnginePaths::with_root`].
#[derive(Debug, Clone)]
pub struct EnginePaths {
    root: PathBuf,
}

impl EnginePaths {
    /// Production layout: `~/.config/skald`.
    pub fn new() -> Self {
        let root = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skald");
        Self { root }
    }

    /// Layout rooted at an explicit directory (tests, embedders).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Model profiles + pointers: `{modelProfiles, modelPointers}`.
    pub fn models_file(&self) -> PathBuf {
        self.root.join("models.json")
    }

    /// Per-project config map keyed by working directory.
    pub fn projects_file(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    /// User-scope MCP server config: `{mcpServers: {name → config}}`.
    pub fn user_mcp_file(&self) -> PathBuf {
        self.root.join("mcp.json")
    }

    /// Project-scope MCP server config inside a working directory.
    pub fn project_mcp_file(working_dir: &Path) -> PathBuf {
        working_dir.join(".skald").join("mcp.json")
    }

    /// Saved sessions, one file per session id: `{messages, todos}`.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    /// Single-file LLM replay cache.
    pub fn llm_cache_file(&self) -> PathBuf {
        self.root.join("llm_cache.json")
    }
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Read and deserialize a JSON file.  `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize `value` and atomically replace `path` with it.
///
/// Writes into a temporary file in the same directory and renames it over
/// the target, so concurrent readers always observe a complete document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    let text = serde_json::to_string_pretty(value)?;
    tmp.write_all(text.as_bytes())
        .with_context(|| format!("writing temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
