// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{PermissionPrompt, Tool, ToolContext, ToolOutput};

/// One registered skill.  Parsing of on-disk skill files is the embedder's
/// concern; the engine only consumes the registered result.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    /// Instructions injected into the conversation when the skill loads.
    pub content: String,
}

/// Registry of programmatically registered skills.
#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<BTreeMap<String, SkillEntry>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: SkillEntry) {
        self.skills
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<SkillEntry> {
        self.skills
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.skills
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

pub struct SkillTool {
    registry: Arc<SkillRegistry>,
}

impl SkillTool {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        "Skill"
    }

    fn description(&self) -> &str {
        "Loads a named skill: a packaged set of instructions for a particular kind \
         of task. The skill's instructions are returned and should be followed for \
         the remainder of the task. Only registered skill names are valid."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "Name of the skill to load"
                }
            },
            "required": ["skill_name"]
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<(), String> {
        let name = input["skill_name"]
            .as_str()
            .ok_or_else(|| "missing 'skill_name'".to_string())?;
        if self.registry.get(name).is_none() {
            return Err(format!(
                "unknown skill '{name}'; available: {}",
                self.registry.names().join(", ")
            ));
        }
        Ok(())
    }

    fn gen_tool_permission(&self, input: &Value) -> Option<PermissionPrompt> {
        let name = input["skill_name"].as_str()?;
        Some(PermissionPrompt {
            title: format!("Run skill '{name}'"),
            content: self
                .registry
                .get(name)
                .map(|s| s.description)
                .unwrap_or_default(),
        })
    }

    fn display_title(&self, input: &Value) -> String {
        input["skill_name"]
            .as_str()
            .map(|n| format!("Skill: {n}"))
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn invoke(&self, input: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let name = input["skill_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'skill_name'"))?;
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown skill '{name}'"))?;
        Ok(ToolOutput::with_data(
            json!({ "skill": name }),
            format!(
                "Loaded skill '{name}'. Follow these instructions:\n\n{}",
                entry.content
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

    fn tool_with(names: &[&str]) -> SkillTool {
        let registry = Arc::new(SkillRegistry::new());
        for name in names {
            registry.register(SkillEntry {
                name: name.to_string(),
                description: format!("{name} skill"),
                content: format!("steps for {name}"),
            });
        }
        SkillTool::new(registry)
    }

    #[tokio::test]
    async fn loads_registered_skill_content() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with(&["commit"]);
        let out = tool
            .invoke(&json!({"skill_name": "commit"}), &context(dir.path()))
            .await
            .unwrap();
        assert!(out.result_for_assistant.contains("steps for commit"));
    }

    #[test]
    fn unknown_skill_fails_validation_with_listing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with(&["commit", "deploy"]);
        let err = tool
            .validate_input(&json!({"skill_name": "ghost"}), &context(dir.path()))
            .unwrap_err();
        assert!(err.contains("unknown skill"));
        assert!(err.contains("commit, deploy"));
    }

    #[test]
    fn permission_prompt_includes_description() {
        let tool = tool_with(&["commit"]);
        let prompt = tool
            .gen_tool_permission(&json!({"skill_name": "commit"}))
            .unwrap();
        assert_eq!(prompt.title, "Run skill 'commit'");
        assert_eq!(prompt.content, "commit skill");
    }
}
