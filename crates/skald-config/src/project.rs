// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{read_json, write_json_atomic};

/// Upper bound on remembered input history entries per project.
pub const MAX_PROJECT_HISTORY: usize = 30;

/// Upper bound on tracked projects; the stalest (oldest `lastEditTime`)
/// are evicted when a new project pushes past this.
pub const MAX_PROJECTS: usize = 20;

/// Persisted per-working-directory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    /// Granted permission keys, kept sorted: `Bash(npm run:*)`,
    /// `Skill(commit)`, `mcp__server__tool`, …
    pub allowed_tools: Vec<String>,
    /// User inputs, newest first, capped at [`MAX_PROJECT_HISTORY`].
    pub history: Vec<String>,
    /// Epoch milliseconds of the last mutation; drives project eviction.
    pub last_edit_time: i64,
    /// Free-form project rules surfaced in the first-turn reminder.
    pub rules: Vec<String>,
}

/// Store of all per-project configs, persisted as one JSON map keyed by the
/// project's absolute working directory.
///
/// Mutations rewrite the file atomically; a persistence failure logs and
/// keeps the in-memory state authoritative for the rest of the session.
pub struct ProjectStore {
    file: PathBuf,
    projects: Mutex<BTreeMap<String, ProjectConfig>>,
}

impl ProjectStore {
    pub fn load(file: PathBuf) -> Self {
        let projects = match read_json::<BTreeMap<String, ProjectConfig>>(&file) {
            Ok(Some(map)) => map,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "unreadable project store; starting empty");
                BTreeMap::new()
            }
        };
        Self {
            file,
            projects: Mutex::new(projects),
        }
    }

    fn key(working_dir: &Path) -> String {
        working_dir.to_string_lossy().into_owned()
    }

    /// Current config for a project, creating it on first touch.
    ///
    /// Creation evicts the oldest projects (by `lastEditTime`) beyond
    /// [`MAX_PROJECTS`].
    pub fn get_or_create(&self, working_dir: &Path) -> ProjectConfig {
        let key = Self::key(working_dir);
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        if !projects.contains_key(&key) {
            projects.insert(
                key.clone(),
                ProjectConfig {
                    last_edit_time: now_ms(),
                    ..ProjectConfig::default()
                },
            );
            while projects.len() > MAX_PROJECTS {
                let stalest = projects
                    .iter()
                    .min_by_key(|(_, p)| p.last_edit_time)
                    .map(|(k, _)| k.clone());
                match stalest {
                    Some(k) => {
                        projects.remove(&k);
                    }
                    None => break,
                }
            }
            self.persist(&projects);
        }
        projects.get(&key).cloned().unwrap_or_default()
    }

    pub fn get(&self, working_dir: &Path) -> Option<ProjectConfig> {
        self.projects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(working_dir))
            .cloned()
    }

    /// True when `permission_key` is in the project's allow-list.
    pub fn is_allowed(&self, working_dir: &Path, permission_key: &str) -> bool {
        self.get(working_dir)
            .map(|p| p.allowed_tools.iter().any(|k| k == permission_key))
            .unwrap_or(false)
    }

    /// Add a permission key, keeping the list sorted and free of duplicates.
    pub fn allow_tool(&self, working_dir: &Path, permission_key: &str) {
        self.mutate(working_dir, |p| {
            if !p.allowed_tools.iter().any(|k| k == permission_key) {
                p.allowed_tools.push(permission_key.to_string());
                p.allowed_tools.sort();
            }
        });
    }

    /// Prepend an input to the project history, trimming to the cap.
    /// Consecutive duplicates collapse into one entry.
    pub fn push_history(&self, working_dir: &Path, input: &str) {
        self.mutate(working_dir, |p| {
            if p.history.first().map(String::as_str) == Some(input) {
                return;
            }
            p.history.insert(0, input.to_string());
            p.history.truncate(MAX_PROJECT_HISTORY);
        });
    }

    pub fn history(&self, working_dir: &Path) -> Vec<String> {
        self.get(working_dir).map(|p| p.history).unwrap_or_default()
    }

    pub fn set_rules(&self, working_dir: &Path, rules: Vec<String>) {
        self.mutate(working_dir, |p| p.rules = rules);
    }

    fn mutate<F: FnOnce(&mut ProjectConfig)>(&self, working_dir: &Path, f: F) {
        let key = Self::key(working_dir);
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        let entry = projects.entry(key).or_default();
        f(entry);
        entry.last_edit_time = now_ms();
        self.persist(&projects);
    }

    fn persist(&self, projects: &BTreeMap<String, ProjectConfig>) {
        if let Err(e) = write_json_atomic(&self.file, projects) {
            warn!(file = %self.file.display(), error = %e, "failed to persist project store");
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
