// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rmcp::service::{serve_client, RoleClient, RunningService};
use rmcp::transport::{
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use tracing::{debug, info, warn};

use skald_config::{load_merged_mcp_config, EnginePaths, McpServerConfig, McpTransport};
use skald_tools::Tool;

use crate::proxy::McpProxyTool;

/// Connection state of one configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Connected,
    Error(String),
    Disconnected,
}

/// Cached per-server info, rebuilt on add/remove/update.
#[derive(Debug, Clone)]
pub struct McpServerInfo {
    pub config: McpServerConfig,
    pub status: ServerStatus,
    pub tool_count: usize,
}

struct ConnectedServer {
    service: RunningService<RoleClient, ()>,
    tools: Vec<Arc<dyn Tool>>,
}

/// Validity key of the adapted-tools cache: the mtimes of both config
/// files.  A change to either invalidates everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    user_mtime: Option<i64>,
    project_mtime: Option<i64>,
}

/// Pool of MCP client connections across both config scopes.
///
/// Connection failures are never session-fatal: a failed server keeps its
/// registry entry with an `Error` status and contributes no tools.
pub struct McpManager {
    user_file: PathBuf,
    project_file: PathBuf,
    clients: tokio::sync::Mutex<HashMap<String, ConnectedServer>>,
    infos: Mutex<HashMap<String, McpServerInfo>>,
    cache_key: Mutex<Option<CacheKey>>,
}

impl McpManager {
    pub fn new(paths: &EnginePaths, working_dir: &Path) -> Self {
        Self {
            user_file: paths.user_mcp_file(),
            project_file: EnginePaths::project_mcp_file(working_dir),
            clients: tokio::sync::Mutex::new(HashMap::new()),
            infos: Mutex::new(HashMap::new()),
            cache_key: Mutex::new(None),
        }
    }

    /// Load both config scopes and (re)connect every merged server in
    /// parallel.  Existing connections are dropped first.
    pub async fn startup(&self) {
        self.disconnect_all().await;
        let servers = load_merged_mcp_config(&self.user_file, &self.project_file);
        info!(servers = servers.len(), "connecting MCP servers");

        let handles: Vec<_> = servers
            .into_iter()
            .map(|config| async move {
                let outcome = connect_server(&config).await;
                (config, outcome)
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        let mut clients = self.clients.lock().await;
        let mut infos = self.infos.lock().unwrap_or_else(|e| e.into_inner());
        infos.clear();
        for (config, outcome) in results {
            let name = config.name.clone();
            match outcome {
                Ok(connected) => {
                    infos.insert(
                        name.clone(),
                        McpServerInfo {
                            config,
                            status: ServerStatus::Connected,
                            tool_count: connected.tools.len(),
                        },
                    );
                    clients.insert(name, connected);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "MCP server failed to connect");
                    infos.insert(
                        name,
                        McpServerInfo {
                            config,
                            status: ServerStatus::Error(e.to_string()),
                            tool_count: 0,
                        },
                    );
                }
            }
        }
        *self.cache_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.current_key());
    }

    /// Adapted tools from every connected server.
    ///
    /// Revalidates against the config file mtimes: when either file changed
    /// since the last connect, the whole pool is rebuilt first.
    pub async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let fresh = {
            let key = self.cache_key.lock().unwrap_or_else(|e| e.into_inner());
            *key == Some(self.current_key())
        };
        if !fresh {
            debug!("MCP config changed on disk; rebuilding client pool");
            self.startup().await;
        }
        let clients = self.clients.lock().await;
        clients
            .values()
            .flat_map(|c| c.tools.iter().cloned())
            .collect()
    }

    /// Add or update one server in the user scope and connect it
    /// incrementally, leaving other connections untouched.
    pub async fn upsert_server(&self, config: McpServerConfig) -> anyhow::Result<()> {
        let name = config.name.clone();
        write_server_entry(&self.user_file, &config)?;

        if let Some(old) = self.clients.lock().await.remove(&name) {
            let _ = old.service.cancel().await;
        }
        let (status, tool_count) = match connect_server(&config).await {
            Ok(connected) => {
                let count = connected.tools.len();
                self.clients.lock().await.insert(name.clone(), connected);
                (ServerStatus::Connected, count)
            }
            Err(e) => (ServerStatus::Error(e.to_string()), 0),
        };
        self.infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name,
                McpServerInfo {
                    config,
                    status,
                    tool_count,
                },
            );
        *self.cache_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.current_key());
        Ok(())
    }

    /// Remove a server from the user scope and drop its connection.
    pub async fn remove_server(&self, name: &str) -> anyhow::Result<()> {
        remove_server_entry(&self.user_file, name)?;
        if let Some(old) = self.clients.lock().await.remove(name) {
            let _ = old.service.cancel().await;
        }
        self.infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        *self.cache_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.current_key());
        Ok(())
    }

    pub fn server_infos(&self) -> Vec<McpServerInfo> {
        let infos = self.infos.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<McpServerInfo> = infos.values().cloned().collect();
        list.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        list
    }

    /// Tear down every connection.  Failures log and never propagate; the
    /// client table is always left empty.
    pub async fn disconnect_all(&self) {
        let mut clients = self.clients.lock().await;
        for (name, server) in clients.drain() {
            if let Err(e) = server.service.cancel().await {
                warn!(server = %name, error = %e, "MCP disconnect failed");
            }
        }
        for info in self
            .infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values_mut()
        {
            if info.status == ServerStatus::Connected {
                info.status = ServerStatus::Disconnected;
            }
        }
    }

    fn current_key(&self) -> CacheKey {
        CacheKey {
            user_mtime: file_mtime_ms(&self.user_file),
            project_mtime: file_mtime_ms(&self.project_file),
        }
    }
}

/// Connect one server and adapt its tools, honoring its `useTools` filter.
async fn connect_server(config: &McpServerConfig) -> anyhow::Result<ConnectedServer> {
    let service = match config.transport {
        McpTransport::Stdio => {
            let command = config
                .command
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("stdio server '{}' has no command", config.name))?;
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(&config.args)
                .envs(config.env.iter())
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit());
            let transport = TokioChildProcess::new(cmd)?;
            serve_client((), transport).await?
        }
        McpTransport::Sse => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("sse server '{}' has no url", config.name))?;
            let transport = SseClientTransport::start(url.to_string()).await?;
            serve_client((), transport).await?
        }
        McpTransport::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("http server '{}' has no url", config.name))?;
            let mut headers = reqwest::header::HeaderMap::new();
            for (k, v) in &config.headers {
                let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())?;
                headers.insert(name, reqwest::header::HeaderValue::from_str(v)?);
            }
            let client = reqwest::Client::builder()
                .default_headers(headers)
                .build()?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                    url.to_string(),
                ),
            );
            serve_client((), transport).await?
        }
    };

    let peer = service.peer().clone();
    let remote_tools = peer.list_all_tools().await?;
    let tools: Vec<Arc<dyn Tool>> = remote_tools
        .into_iter()
        .filter(|t| match &config.use_tools {
            None => true,
            Some(allowed) => allowed.iter().any(|a| a == t.name.as_ref()),
        })
        .map(|t| Arc::new(McpProxyTool::new(&config.name, t, peer.clone())) as Arc<dyn Tool>)
        .collect();

    debug!(server = %config.name, tools = tools.len(), "MCP server connected");
    Ok(ConnectedServer { service, tools })
}

fn file_mtime_ms(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

/// Insert or replace one entry under `mcpServers` in a config file.
fn write_server_entry(file: &Path, config: &McpServerConfig) -> anyhow::Result<()> {
    let mut doc: serde_json::Value = skald_config::read_json(file)?
        .unwrap_or_else(|| serde_json::json!({ "mcpServers": {} }));
    doc["mcpServers"][&config.name] = serde_json::to_value(config)?;
    skald_config::write_json_atomic(file, &doc)
}

fn remove_server_entry(file: &Path, name: &str) -> anyhow::Result<()> {
    let Some(mut doc) = skald_config::read_json::<serde_json::Value>(file)? else {
        return Ok(());
    };
    if let Some(map) = doc["mcpServers"].as_object_mut() {
        map.remove(name);
    }
    skald_config::write_json_atomic(file, &doc)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
