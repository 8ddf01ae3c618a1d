use serde::{Deserialize, Serialize};

/// Coarse agent lifecycle state surfaced through `state:update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    #[default]
    Idle,
    Processing,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Processing => "processing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// One entry of an agent's todo list.  At most one item may be
/// `in_progress` at any time; writers enforce this before mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    /// Present-continuous rendering used while the item is in progress.
    pub active_form: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Count of `in_progress` items; used by both TodoWrite validation and the
/// state manager's own invariant check.
pub fn in_progress_count(todos: &[TodoItem]) -> usize {
    todos
        .iter()
        .filter(|t| t.status == TodoStatus::InProgress)
        .count()
}
