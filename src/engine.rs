// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use skald_config::{AgentMode, ConfigManager, CoreConfig, EnginePaths, ProjectStore};
use skald_core::{
    compact_now, prompts, query, AgentContext, AgentRegistry, PermissionEngine, ProviderFactory,
    Services, TaskTool,
};
use skald_events::{CancelHandle, EventBus};
use skald_mcp::McpManager;
use skald_model::{
    provider_for, LlmCache, Message, ModelManager, ModelPointer, ContentBlock, Usage,
};
use skald_state::{
    AgentPhase, JsonSessionStore, SessionStore, StateManager, MAIN_AGENT_ID,
};
use skald_tools::{builtin, filter_tools, SkillRegistry, ToolFilter, ToolRegistry};

use crate::commands::{parse_system_command, SystemCommand};
use crate::fileref;

/// Construction parameters for an [`Engine`].
pub struct EngineOptions {
    pub working_dir: PathBuf,
    pub paths: EnginePaths,
    pub config: CoreConfig,
    /// Override the HTTP provider construction; tests route this to a
    /// scripted mock.
    pub provider_factory: Option<ProviderFactory>,
}

impl EngineOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            paths: EnginePaths::new(),
            config: CoreConfig::default(),
            provider_factory: None,
        }
    }

    pub fn with_paths(mut self, paths: EnginePaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = Some(factory);
        self
    }
}

/// The public face of the engine: session lifecycle, user input, mode
/// switching, interrupts, and teardown.  All interaction with a running
/// turn flows through the [`EventBus`].
pub struct Engine {
    services: Arc<Services>,
    session_store: Arc<dyn SessionStore>,
    agents: Arc<AgentRegistry>,
}

impl Engine {
    pub async fn new(options: EngineOptions) -> anyhow::Result<Self> {
        let EngineOptions {
            working_dir,
            paths,
            config,
            provider_factory,
        } = options;

        let bus = Arc::new(EventBus::new());
        let session_store: Arc<dyn SessionStore> =
            Arc::new(JsonSessionStore::new(paths.clone()));
        let state = Arc::new(StateManager::new(
            Arc::clone(&bus),
            Some(Arc::clone(&session_store)),
        ));
        let config = Arc::new(ConfigManager::new(config));
        let models = Arc::new(ModelManager::load(paths.models_file()));
        let projects = Arc::new(ProjectStore::load(paths.projects_file()));
        let mcp = Arc::new(McpManager::new(&paths, &working_dir));
        let llm_cache = Arc::new(LlmCache::new(paths.llm_cache_file()));
        let skills = Arc::new(SkillRegistry::new());
        let provider_factory: ProviderFactory =
            provider_factory.unwrap_or_else(|| Arc::new(provider_for));

        let agents = Arc::new(AgentRegistry::new());
        let task_tool = Arc::new(TaskTool::new(Arc::clone(&agents)));
        let mut base_tools = ToolRegistry::new();
        builtin::register_builtins(&mut base_tools, Arc::clone(&skills));
        base_tools.register(Arc::clone(&task_tool) as Arc<dyn skald_tools::Tool>);

        let permissions = Arc::new(PermissionEngine::new(
            Arc::clone(&bus),
            Arc::clone(&config),
            Arc::clone(&state),
            Arc::clone(&projects),
            Arc::clone(&models),
            Arc::clone(&provider_factory),
            working_dir.clone(),
        ));

        let services = Arc::new(Services {
            bus,
            state,
            config,
            models,
            projects,
            mcp,
            llm_cache,
            permissions,
            skills,
            provider_factory,
            base_tools,
            working_dir,
            paths,
        });
        task_tool.attach(&services);

        Ok(Self {
            services,
            session_store,
            agents,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.services.config
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.services.models
    }

    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.services.skills
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.services.mcp
    }

    pub fn message_history(&self) -> Vec<Message> {
        self.services
            .state
            .for_agent(MAIN_AGENT_ID)
            .get_message_history()
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Create (or revive) a session.  Cancels any running work, resets all
    /// agent state and the session-scoped grants, loads prior history when
    /// an existing id is given, and emits `session:ready`.
    pub async fn create_session(&self, session_id: Option<String>) -> anyhow::Result<String> {
        if let Some(cancel) = self.services.state.cancel_handle() {
            cancel.cancel();
        }
        self.services.state.clear_all_agents();

        let revive = session_id.is_some();
        let session_id =
            session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.services.state.reset_session(&session_id);

        let main = self.services.state.for_agent(MAIN_AGENT_ID);
        let mut history_loaded = false;
        if revive {
            match self.session_store.load(&session_id) {
                Ok(Some(saved)) => {
                    history_loaded = !saved.messages.is_empty();
                    main.set_message_history(saved.messages);
                    main.set_todos(saved.todos);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to load saved session");
                }
            }
        }

        // Plugin init (MCP pool, skills) must not block readiness.
        let mcp = Arc::clone(&self.services.mcp);
        tokio::spawn(async move { mcp.startup().await });

        let usage = latest_usage(&main.get_message_history());
        let max_tokens = self
            .services
            .models
            .profile_for(ModelPointer::Main)
            .map(|p| p.context_length)
            .unwrap_or(0);
        self.services.bus.emit(
            "session:ready",
            json!({
                "workingDir": self.services.working_dir.to_string_lossy(),
                "sessionId": session_id,
                "historyLoaded": history_loaded,
                "usage": {
                    "useTokens": usage.context_tokens() + usage.output_tokens,
                    "maxTokens": max_tokens,
                    "promptTokens": usage.input_tokens,
                },
                "projectInputHistory": self.services.projects.history(&self.services.working_dir),
            }),
        );
        main.update_state(AgentPhase::Idle);
        Ok(session_id)
    }

    /// Process one user input on the main agent.
    ///
    /// System commands are handled synchronously; everything else becomes a
    /// model turn.  `original_text` (when given) is what lands in the
    /// project input history — callers pass the pre-expansion text here.
    pub async fn process_user_input(
        &self,
        text: &str,
        original_text: Option<&str>,
    ) -> anyhow::Result<()> {
        let main = self.services.state.for_agent(MAIN_AGENT_ID);
        main.update_state(AgentPhase::Processing);
        let cancel = CancelHandle::new();
        self.services.state.set_cancel_handle(cancel.clone());

        self.services
            .projects
            .push_history(&self.services.working_dir, original_text.unwrap_or(text));

        let conf = self.services.config.get();
        let tools = filter_tools(
            &self.services.base_tools,
            conf.use_tools.as_deref(),
            &self.services.mcp.tools().await,
            conf.agent_mode,
            ToolFilter::MainAgent,
        );
        let ctx = AgentContext {
            agent_id: MAIN_AGENT_ID.to_string(),
            cancel,
            tools,
            model_pointer: ModelPointer::Main,
        };

        if let Some(command) = parse_system_command(text) {
            self.run_system_command(command, &ctx).await;
            return Ok(());
        }

        // Custom /name expansion is an embedder concern; unexpanded slash
        // inputs flow through as plain text.

        let mut blocks = Vec::new();
        for reminder in fileref::build_reference_reminders(&self.services, &ctx, text).await {
            blocks.push(ContentBlock::text(reminder));
        }

        let history = main.get_message_history();
        if history.is_empty() {
            // First turn of a fresh topic: surface a provisional title so
            // UIs can label the session before any model output arrives.
            let title: String = text.chars().take(60).collect();
            self.services.bus.emit(
                "topic:update",
                json!({ "isNewTopic": true, "title": title }),
            );
            if ctx.tools.get("TodoWrite").is_some() {
                blocks.push(ContentBlock::text(prompts::todos_reminder(&main.get_todos())));
            }
            let project_rules = self
                .services
                .projects
                .get(&self.services.working_dir)
                .map(|p| p.rules)
                .unwrap_or_default();
            if let Some(rules) = prompts::rules_reminder(
                &self.services.paths.root().join("AGENT.md"),
                &self.services.working_dir,
                &conf.custom_rules,
                &project_rules,
            ) {
                blocks.push(ContentBlock::text(rules));
            }
        }
        if conf.agent_mode == AgentMode::Plan && !self.services.state.plan_mode_info_sent() {
            blocks.push(ContentBlock::text(prompts::plan_mode_reminder()));
            self.services.state.mark_plan_mode_info_sent();
        }
        blocks.push(ContentBlock::text(text));

        let system_prompt = prompts::build_system_prompt(&conf, &self.services.working_dir);
        let mut messages = history;
        messages.push(Message::user_blocks(blocks));

        match query(&self.services, &ctx, messages, system_prompt).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // The failed turn is not persisted; query never finalized.
                main.update_state(AgentPhase::Idle);
                Err(e)
            }
        }
    }

    async fn run_system_command(&self, command: SystemCommand, ctx: &AgentContext) {
        let main = self.services.state.for_agent(MAIN_AGENT_ID);
        match command {
            SystemCommand::Clear => {
                debug!("clearing session history");
                main.set_message_history(Vec::new());
                main.set_todos(Vec::new());
                self.services.bus.emit(
                    "session:cleared",
                    json!({ "sessionId": self.services.state.session_id() }),
                );
            }
            SystemCommand::Compact => {
                let messages = main.get_message_history();
                if let Some(compacted) = compact_now(&self.services, ctx, &messages).await {
                    main.set_message_history(compacted);
                }
            }
        }
        main.update_state(AgentPhase::Idle);
    }

    /// Abort the in-flight turn, if any, and return the main agent to idle.
    pub fn interrupt_session(&self) {
        if let Some(cancel) = self.services.state.cancel_handle() {
            cancel.cancel();
        }
        self.services
            .state
            .for_agent(MAIN_AGENT_ID)
            .update_state(AgentPhase::Idle);
    }

    /// Switch the agent mode.  Switching into Plan re-arms the one-shot
    /// plan-mode reminder.
    pub fn update_agent_mode(&self, mode: AgentMode) {
        if self.services.config.agent_mode() == mode {
            return;
        }
        self.services.config.set_agent_mode(mode);
        if mode == AgentMode::Plan {
            self.services.state.reset_plan_mode_info();
        }
    }

    /// Tear the engine down: abort work, drop all state and listeners, and
    /// disconnect the MCP pool.
    pub async fn dispose(&self) {
        if let Some(cancel) = self.services.state.cancel_handle() {
            cancel.cancel();
        }
        self.services.state.clear_all_agents();
        self.services.mcp.disconnect_all().await;
        self.services.bus.clear();
    }
}

fn latest_usage(messages: &[Message]) -> Usage {
    messages
        .iter()
        .rev()
        .find_map(|m| {
            m.as_assistant()
                .filter(|a| a.usage.is_authoritative())
                .map(|a| a.usage.clone())
        })
        .unwrap_or_default()
}
