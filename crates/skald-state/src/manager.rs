// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::warn;

use skald_events::{CancelHandle, EventBus};
use skald_model::Message;

use crate::persist::{SavedSession, SessionStore};
use crate::types::{AgentPhase, TodoItem};

/// Fixed id of the root agent.  Anything else is a subagent; subagents
/// never broadcast the global events (`state:update`, `conversation:usage`,
/// `todos:update`, `topic:update`).
pub const MAIN_AGENT_ID: &str = "main";

#[derive(Default)]
struct AgentPartition {
    current_state: AgentPhase,
    previous_state: AgentPhase,
    message_history: Vec<Message>,
    todos: Vec<TodoItem>,
    /// Absolute path → mtime (epoch ms) recorded on the last successful
    /// read.  The edit gate compares against this.
    read_file_timestamps: HashMap<String, i64>,
}

#[derive(Default)]
struct SharedState {
    session_id: String,
    global_edit_permission_granted: bool,
    plan_mode_info_sent: bool,
    current_cancel_handle: Option<CancelHandle>,
}

/// Per-agent state partitions plus session-wide shared state.
///
/// One instance per engine.  All access goes through [`AgentHandle`]s or
/// the shared-state accessors; locks are held only for the duration of one
/// operation.
pub struct StateManager {
    agents: Mutex<HashMap<String, AgentPartition>>,
    shared: Mutex<SharedState>,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn SessionStore>>,
}

impl StateManager {
    pub fn new(bus: Arc<EventBus>, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            shared: Mutex::new(SharedState::default()),
            bus,
            store,
        }
    }

    /// Handle onto one agent's partition, creating it on first use.
    pub fn for_agent(self: &Arc<Self>, agent_id: &str) -> AgentHandle {
        AgentHandle {
            manager: Arc::clone(self),
            agent_id: agent_id.to_string(),
        }
    }

    // ── Shared session state ──────────────────────────────────────────────────

    pub fn session_id(&self) -> String {
        self.shared().session_id.clone()
    }

    /// Reset the session id.  This also revokes the session-scoped file-edit
    /// grant and re-arms the one-shot plan-mode reminder.
    pub fn reset_session(&self, session_id: &str) {
        let mut shared = self.shared();
        shared.session_id = session_id.to_string();
        shared.global_edit_permission_granted = false;
        shared.plan_mode_info_sent = false;
    }

    pub fn global_edit_permission_granted(&self) -> bool {
        self.shared().global_edit_permission_granted
    }

    pub fn grant_global_edit_permission(&self) {
        self.shared().global_edit_permission_granted = true;
    }

    pub fn plan_mode_info_sent(&self) -> bool {
        self.shared().plan_mode_info_sent
    }

    pub fn mark_plan_mode_info_sent(&self) {
        self.shared().plan_mode_info_sent = true;
    }

    pub fn reset_plan_mode_info(&self) {
        self.shared().plan_mode_info_sent = false;
    }

    pub fn set_cancel_handle(&self, handle: CancelHandle) {
        self.shared().current_cancel_handle = Some(handle);
    }

    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.shared().current_cancel_handle.clone()
    }

    /// Drop every agent partition (session teardown).
    pub fn clear_all_agents(&self) {
        self.agents.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_partition<R>(&self, agent_id: &str, f: impl FnOnce(&mut AgentPartition) -> R) -> R {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        f(agents.entry(agent_id.to_string()).or_default())
    }

    fn persist_main_session(&self, messages: Vec<Message>, todos: Vec<TodoItem>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let session_id = self.session_id();
        if session_id.is_empty() {
            return;
        }
        // Best-effort, off the caller's path.
        tokio::spawn(async move {
            let mut messages = messages;
            skald_model::strip_stale_usage(&mut messages);
            let session = SavedSession { messages, todos };
            if let Err(e) = store.save(&session_id, &session) {
                warn!(session_id = %session_id, error = %e, "failed to persist session history");
            }
        });
    }
}

/// View of one agent's partition.
#[derive(Clone)]
pub struct AgentHandle {
    manager: Arc<StateManager>,
    agent_id: String,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_main(&self) -> bool {
        self.agent_id == MAIN_AGENT_ID
    }

    // ── Todos ─────────────────────────────────────────────────────────────────

    pub fn get_todos(&self) -> Vec<TodoItem> {
        self.manager
            .with_partition(&self.agent_id, |p| p.todos.clone())
    }

    pub fn set_todos(&self, todos: Vec<TodoItem>) {
        self.manager
            .with_partition(&self.agent_id, |p| p.todos = todos.clone());
        self.broadcast_todos(&todos);
    }

    /// Merge-by-id when every incoming todo carries an id that already
    /// exists; otherwise replace the whole list.
    pub fn update_todos_intelligently(&self, new_todos: Vec<TodoItem>) {
        let merged = self.manager.with_partition(&self.agent_id, |p| {
            let mergeable = !new_todos.is_empty()
                && new_todos.iter().all(|t| {
                    t.id.as_ref()
                        .map(|id| p.todos.iter().any(|cur| cur.id.as_deref() == Some(id)))
                        .unwrap_or(false)
                });
            if mergeable {
                for incoming in &new_todos {
                    if let Some(slot) = p
                        .todos
                        .iter_mut()
                        .find(|cur| cur.id == incoming.id)
                    {
                        *slot = incoming.clone();
                    }
                }
            } else {
                p.todos = new_todos.clone();
            }
            p.todos.clone()
        });
        self.broadcast_todos(&merged);
    }

    fn broadcast_todos(&self, todos: &[TodoItem]) {
        if self.is_main() {
            self.manager
                .bus
                .emit("todos:update", json!({ "todos": todos }));
        }
    }

    // ── Message history ───────────────────────────────────────────────────────

    pub fn get_message_history(&self) -> Vec<Message> {
        self.manager
            .with_partition(&self.agent_id, |p| p.message_history.clone())
    }

    pub fn set_message_history(&self, messages: Vec<Message>) {
        let todos = self.manager.with_partition(&self.agent_id, |p| {
            p.message_history = messages.clone();
            p.todos.clone()
        });
        if self.is_main() && !messages.is_empty() {
            self.manager.persist_main_session(messages, todos);
        }
    }

    /// Commit the final history of a turn and return the agent to idle.
    pub fn finalize_messages(&self, messages: Vec<Message>) {
        self.set_message_history(messages);
        self.update_state(AgentPhase::Idle);
    }

    // ── Read-file timestamps ──────────────────────────────────────────────────

    pub fn get_read_file_timestamp(&self, path: &str) -> Option<i64> {
        self.manager.with_partition(&self.agent_id, |p| {
            p.read_file_timestamps.get(path).copied()
        })
    }

    pub fn set_read_file_timestamp(&self, path: &str, mtime_ms: i64) {
        self.manager.with_partition(&self.agent_id, |p| {
            p.read_file_timestamps.insert(path.to_string(), mtime_ms);
        });
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn current_state(&self) -> AgentPhase {
        self.manager
            .with_partition(&self.agent_id, |p| p.current_state)
    }

    pub fn update_state(&self, new_state: AgentPhase) {
        self.manager.with_partition(&self.agent_id, |p| {
            p.previous_state = p.current_state;
            p.current_state = new_state;
        });
        if self.is_main() {
            self.manager
                .bus
                .emit("state:update", json!({ "state": new_state.as_str() }));
        }
    }

    /// Wipe this agent's partition.  Intentionally a no-op for the main
    /// agent — main state is torn down only through the engine facade.
    pub fn clear_all_state(&self) {
        if self.is_main() {
            return;
        }
        let mut agents = self
            .manager
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        agents.remove(&self.agent_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::TodoStatus;

    fn manager() -> Arc<StateManager> {
        Arc::new(StateManager::new(Arc::new(EventBus::new()), None))
    }

    fn todo(id: &str, status: TodoStatus) -> TodoItem {
        TodoItem {
            content: format!("task {id}"),
            status,
            active_form: format!("doing {id}"),
            id: Some(id.to_string()),
        }
    }

    #[test]
    fn partitions_are_isolated_per_agent() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        let sub = mgr.for_agent("sub-1");
        main.set_message_history(vec![Message::user_text("main msg")]);
        sub.set_message_history(vec![Message::user_text("sub msg")]);
        assert_eq!(main.get_message_history().len(), 1);
        assert_eq!(main.get_message_history()[0].plain_text(), "main msg");
        assert_eq!(sub.get_message_history()[0].plain_text(), "sub msg");
    }

    #[test]
    fn clear_all_state_is_noop_for_main() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        main.set_message_history(vec![Message::user_text("keep me")]);
        main.clear_all_state();
        assert_eq!(main.get_message_history().len(), 1);
    }

    #[test]
    fn clear_all_state_wipes_subagent() {
        let mgr = manager();
        let sub = mgr.for_agent("sub-1");
        sub.set_message_history(vec![Message::user_text("gone")]);
        sub.set_read_file_timestamp("/a", 1);
        sub.clear_all_state();
        assert!(sub.get_message_history().is_empty());
        assert!(sub.get_read_file_timestamp("/a").is_none());
    }

    #[test]
    fn update_state_tracks_previous() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        main.update_state(AgentPhase::Processing);
        assert_eq!(main.current_state(), AgentPhase::Processing);
        main.update_state(AgentPhase::Idle);
        assert_eq!(main.current_state(), AgentPhase::Idle);
    }

    #[test]
    fn main_state_update_emits_event() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on("state:update", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let mgr = Arc::new(StateManager::new(Arc::clone(&bus), None));
        mgr.for_agent(MAIN_AGENT_ID).update_state(AgentPhase::Processing);
        mgr.for_agent("sub-1").update_state(AgentPhase::Processing);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "only main broadcasts state");
    }

    #[test]
    fn subagent_todos_do_not_broadcast() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on("todos:update", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let mgr = Arc::new(StateManager::new(Arc::clone(&bus), None));
        mgr.for_agent("sub-1")
            .set_todos(vec![todo("1", TodoStatus::Pending)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        mgr.for_agent(MAIN_AGENT_ID)
            .set_todos(vec![todo("1", TodoStatus::Pending)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn intelligent_update_merges_by_id() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        main.set_todos(vec![
            todo("1", TodoStatus::InProgress),
            todo("2", TodoStatus::Pending),
        ]);
        main.update_todos_intelligently(vec![todo("1", TodoStatus::Completed)]);
        let todos = main.get_todos();
        assert_eq!(todos.len(), 2, "merge keeps untouched items");
        assert_eq!(todos[0].status, TodoStatus::Completed);
        assert_eq!(todos[1].status, TodoStatus::Pending);
    }

    #[test]
    fn intelligent_update_replaces_when_ids_unknown() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        main.set_todos(vec![todo("1", TodoStatus::Pending)]);
        main.update_todos_intelligently(vec![todo("9", TodoStatus::Pending)]);
        let todos = main.get_todos();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].id.as_deref(), Some("9"));
    }

    #[test]
    fn intelligent_update_replaces_when_ids_missing() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        main.set_todos(vec![todo("1", TodoStatus::Pending)]);
        let unnamed = TodoItem {
            content: "anonymous".into(),
            status: TodoStatus::Pending,
            active_form: "working".into(),
            id: None,
        };
        main.update_todos_intelligently(vec![unnamed]);
        assert_eq!(main.get_todos().len(), 1);
        assert!(main.get_todos()[0].id.is_none());
    }

    #[test]
    fn read_file_timestamps_round_trip() {
        let mgr = manager();
        let main = mgr.for_agent(MAIN_AGENT_ID);
        assert!(main.get_read_file_timestamp("/proj/a.rs").is_none());
        main.set_read_file_timestamp("/proj/a.rs", 1_700_000_000_000);
        assert_eq!(main.get_read_file_timestamp("/proj/a.rs"), Some(1_700_000_000_000));
    }

    #[test]
    fn reset_session_revokes_edit_grant() {
        let mgr = manager();
        mgr.reset_session("s1");
        mgr.grant_global_edit_permission();
        mgr.mark_plan_mode_info_sent();
        mgr.reset_session("s2");
        assert!(!mgr.global_edit_permission_granted());
        assert!(!mgr.plan_mode_info_sent());
        assert_eq!(mgr.session_id(), "s2");
    }

    #[tokio::test]
    async fn main_history_persists_through_store() {
        use crate::persist::{JsonSessionStore, SessionStore};
        use skald_config::EnginePaths;

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> =
            Arc::new(JsonSessionStore::new(EnginePaths::with_root(dir.path())));
        let mgr = Arc::new(StateManager::new(
            Arc::new(EventBus::new()),
            Some(Arc::clone(&store)),
        ));
        mgr.reset_session("persist-me");
        mgr.for_agent(MAIN_AGENT_ID)
            .set_message_history(vec![Message::user_text("saved")]);
        // Persistence is spawned; give it a tick.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let loaded = store.load("persist-me").unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }
}
