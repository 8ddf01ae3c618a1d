// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::read_json;

/// How an MCP server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    #[default]
    Stdio,
    Sse,
    Http,
}

/// Configuration scope an MCP server was defined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpScope {
    User,
    Project,
}

/// One MCP server entry as it appears under `mcpServers` in a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerConfig {
    #[serde(skip)]
    pub name: String,
    pub transport: McpTransport,
    /// stdio: executable to spawn.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// sse / http: endpoint URL.
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Tools to expose from this server; `None` exposes everything.
    pub use_tools: Option<Vec<String>>,
    /// `Some(false)` removes the server from the merged view entirely.
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// On-disk shape: `{"mcpServers": {"<name>": {…}}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct McpConfigFile {
    mcp_servers: BTreeMap<String, McpServerConfig>,
}

/// Load both scopes and merge them: project entries shadow user entries of
/// the same name; disabled entries are dropped from the result.
///
/// Unreadable files degrade to an empty scope — a broken project config must
/// not take out servers configured at the user level.
pub fn load_merged_mcp_config(
    user_file: &Path,
    project_file: &Path,
) -> Vec<McpServerConfig> {
    let mut merged: BTreeMap<String, McpServerConfig> = BTreeMap::new();
    for (scope, path) in [(McpScope::User, user_file), (McpScope::Project, project_file)] {
        let layer = match read_json::<McpConfigFile>(path) {
            Ok(Some(file)) => file.mcp_servers,
            Ok(None) => continue,
            Err(e) => {
                warn!(scope = ?scope, file = %path.display(), error = %e, "skipping unreadable MCP config");
                continue;
            }
        };
        for (name, mut server) in layer {
            server.name = name.clone();
            merged.insert(name, server);
        }
    }
    merged
        .into_values()
        .filter(McpServerConfig::is_enabled)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
