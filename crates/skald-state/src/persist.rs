// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use skald_config::{read_json, write_json_atomic, EnginePaths};
use skald_model::Message;

use crate::types::TodoItem;

/// On-disk session shape: `{messages, todos}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedSession {
    pub messages: Vec<Message>,
    pub todos: Vec<TodoItem>,
}

/// Persistence hook for session history.  The engine saves through this
/// after every main-agent history write; failures are logged by the caller
/// and never fatal.
pub trait SessionStore: Send + Sync {
    fn save(&self, session_id: &str, session: &SavedSession) -> anyhow::Result<()>;
    fn load(&self, session_id: &str) -> anyhow::Result<Option<SavedSession>>;
}

/// Default store: one JSON file per session under the engine data dir.
pub struct JsonSessionStore {
    paths: EnginePaths,
}

impl JsonSessionStore {
    pub fn new(paths: EnginePaths) -> Self {
        Self { paths }
    }
}

impl SessionStore for JsonSessionStore {
    fn save(&self, session_id: &str, session: &SavedSession) -> anyhow::Result<()> {
        write_json_atomic(&self.paths.session_file(session_id), session)
    }

    fn load(&self, session_id: &str) -> anyhow::Result<Option<SavedSession>> {
        read_json(&self.paths.session_file(session_id))
    }
}
