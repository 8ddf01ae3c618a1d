// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use skald_config::{ConfigManager, EnginePaths, ProjectStore};
use skald_events::{CancelHandle, EventBus};
use skald_mcp::McpManager;
use skald_model::{
    collect_stream, AdapterRequest, AssistantMessage, CachedCompletion, ContentBlock, LlmCache,
    Message, ModelManager, ModelPointer, ModelProfile, ModelProvider, Usage,
};
use skald_state::{StateManager, MAIN_AGENT_ID};
use skald_tools::{filter_tools, ModelTier, SkillRegistry, ToolContext, ToolFilter, ToolRegistry};

use crate::compact::compact_if_needed;
use crate::constants::{INTERRUPT_MESSAGE, INTERRUPT_MESSAGE_FOR_TOOL_USE, NO_CONTENT_MESSAGE};
use crate::permission::{PermissionEngine, ProviderFactory};
use crate::prompts;
use crate::runner::{run_tool_batch, ToolUseRequest};

/// Everything the conversation loop and its satellites share.  One
/// instance per engine; all fields are injectable so tests can assemble a
/// fixture without process-wide state.
pub struct Services {
    pub bus: Arc<EventBus>,
    pub state: Arc<StateManager>,
    pub config: Arc<ConfigManager>,
    pub models: Arc<ModelManager>,
    pub projects: Arc<ProjectStore>,
    pub mcp: Arc<McpManager>,
    pub llm_cache: Arc<LlmCache>,
    pub permissions: Arc<PermissionEngine>,
    pub skills: Arc<SkillRegistry>,
    pub provider_factory: ProviderFactory,
    /// Unfiltered built-in tools (including `Task`); the per-turn list is
    /// derived from this through the filter pipeline.
    pub base_tools: ToolRegistry,
    pub working_dir: PathBuf,
    pub paths: EnginePaths,
}

impl Services {
    pub fn provider(&self, profile: ModelProfile) -> Arc<dyn ModelProvider> {
        (self.provider_factory)(profile)
    }

    /// Tool-facing view of an agent context.
    pub fn tool_context(&self, ctx: &AgentContext) -> ToolContext {
        ToolContext {
            agent_id: ctx.agent_id.clone(),
            cancel: ctx.cancel.clone(),
            bus: Arc::clone(&self.bus),
            state: Arc::clone(&self.state),
            config: Arc::clone(&self.config),
            working_dir: self.working_dir.clone(),
            model_tier: match ctx.model_pointer {
                ModelPointer::Main => ModelTier::Main,
                ModelPointer::Quick => ModelTier::Quick,
            },
        }
    }
}

/// Identity and capabilities of one running agent.
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: String,
    /// Shared with every subagent spawned during this turn.
    pub cancel: CancelHandle,
    /// Tool list already filtered for this agent.
    pub tools: ToolRegistry,
    pub model_pointer: ModelPointer,
}

/// The agent step function: stream one assistant message, execute its tool
/// calls, feed the results back, and repeat until a turn produces no tool
/// calls.  Returns the final message history (which has also been written
/// to the agent's state partition).
pub async fn query(
    services: &Arc<Services>,
    ctx: &AgentContext,
    messages: Vec<Message>,
    system_prompt: Vec<String>,
) -> anyhow::Result<Vec<Message>> {
    let agent = services.state.for_agent(&ctx.agent_id);
    let is_main = ctx.agent_id == MAIN_AGENT_ID;
    let mut messages = messages;
    let mut system_prompt = system_prompt;
    let mut tools = ctx.tools.clone();

    loop {
        // Subagents run on short leashes and never compact.
        if is_main {
            if let Some(compacted) = compact_if_needed(services, ctx, &messages).await {
                messages = compacted;
                emit_conversation_usage(services, ctx, &messages);
            }
        }

        let assistant = run_completion(services, ctx, &messages, &system_prompt, &tools).await?;

        // Checkpoint: cancelled during streaming, before tool execution.
        if ctx.cancel.is_cancelled() {
            services.bus.emit(
                "session:interrupted",
                json!({ "agentId": ctx.agent_id, "content": INTERRUPT_MESSAGE }),
            );
            // Any tool uses in the partial message still need results, or
            // the next request would be rejected for unpaired tool uses.
            let mut blocks: Vec<ContentBlock> = assistant
                .tool_uses()
                .iter()
                .map(|(id, _, _)| ContentBlock::tool_error(*id, INTERRUPT_MESSAGE_FOR_TOOL_USE))
                .collect();
            blocks.push(ContentBlock::text(INTERRUPT_MESSAGE));
            messages.push(Message::Assistant(assistant));
            messages.push(Message::user_blocks(blocks));
            agent.finalize_messages(messages.clone());
            return Ok(messages);
        }

        let uses: Vec<ToolUseRequest> = assistant
            .tool_uses()
            .iter()
            .map(|(id, name, input)| ToolUseRequest {
                id: (*id).to_string(),
                name: (*name).to_string(),
                input: (*input).clone(),
            })
            .collect();

        emit_message_complete(services, ctx, &assistant, &uses);
        messages.push(Message::Assistant(assistant));
        if is_main {
            emit_conversation_usage(services, ctx, &messages);
        }

        if uses.is_empty() {
            agent.finalize_messages(messages.clone());
            return Ok(messages);
        }

        let outcome = run_tool_batch(services, ctx, &tools, uses).await;

        // Checkpoint: cancelled during the tool batch.
        if ctx.cancel.is_cancelled() && !ctx.cancel.is_refused() {
            let mut blocks = outcome.blocks;
            if let Some(ContentBlock::ToolResult {
                content, is_error, ..
            }) = blocks.last_mut()
            {
                let appended = format!(
                    "{}\n{INTERRUPT_MESSAGE_FOR_TOOL_USE}",
                    content.as_str().unwrap_or_default()
                );
                *content = json!(appended);
                *is_error = true;
            }
            messages.push(Message::tool_results(blocks));
            if is_main {
                emit_conversation_usage(services, ctx, &messages);
            }
            services.bus.emit(
                "session:interrupted",
                json!({ "agentId": ctx.agent_id, "content": INTERRUPT_MESSAGE_FOR_TOOL_USE }),
            );
            agent.finalize_messages(messages.clone());
            return Ok(messages);
        }

        // A permission refusal ends the turn with the rejection result but
        // is not an interrupt: no session:interrupted, no recursion.
        if ctx.cancel.is_refused() {
            messages.push(Message::tool_results(outcome.blocks));
            agent.finalize_messages(messages.clone());
            return Ok(messages);
        }

        if let Some(rebuild) = outcome.rebuild {
            debug!(reason = %rebuild.reason, "rebuilding context");
            let results = Message::tool_results(outcome.blocks);
            let conf = services.config.get();
            tools = filter_tools(
                &services.base_tools,
                conf.use_tools.as_deref(),
                &services.mcp.tools().await,
                conf.agent_mode,
                ToolFilter::MainAgent,
            );
            system_prompt = prompts::build_system_prompt(&conf, &services.working_dir);
            match rebuild.rebuild_message {
                Some(rebuild_message) => {
                    // Fresh history: reminders plus the synthetic kickoff
                    // message replace everything before this point.
                    let mut blocks = Vec::new();
                    if tools.get("TodoWrite").is_some() {
                        blocks.push(ContentBlock::text(prompts::todos_reminder(
                            &agent.get_todos(),
                        )));
                    }
                    let project_rules = services
                        .projects
                        .get(&services.working_dir)
                        .map(|p| p.rules)
                        .unwrap_or_default();
                    if let Some(rules) = prompts::rules_reminder(
                        &services.paths.root().join("AGENT.md"),
                        &services.working_dir,
                        &conf.custom_rules,
                        &project_rules,
                    ) {
                        blocks.push(ContentBlock::text(rules));
                    }
                    blocks.push(ContentBlock::text(rebuild_message));
                    messages = vec![Message::user_blocks(blocks)];
                }
                None => {
                    messages.push(results);
                }
            }
            continue;
        }

        messages.push(Message::tool_results(outcome.blocks));
    }
}

/// One streaming completion, routed through the replay cache when enabled.
async fn run_completion(
    services: &Arc<Services>,
    ctx: &AgentContext,
    messages: &[Message],
    system_prompt: &[String],
    tools: &ToolRegistry,
) -> anyhow::Result<AssistantMessage> {
    let conf = services.config.get();
    let Some(profile) = services.models.profile_for(ctx.model_pointer) else {
        services.bus.emit(
            "config:no_models",
            json!({
                "message": "No model is configured for this session.",
                "suggestion": "Add a model profile and point 'main' at it.",
            }),
        );
        anyhow::bail!("no model configured for pointer '{}'", ctx.model_pointer.key());
    };

    let req = AdapterRequest {
        messages: messages.to_vec(),
        system_prompt: system_prompt.to_vec(),
        tools: tools
            .schemas()
            .into_iter()
            .map(|s| skald_model::ToolSchema {
                name: s.name,
                description: s.description,
                input_schema: s.input_schema,
            })
            .collect(),
        enable_thinking: conf.enable_thinking,
        emit_chunks: conf.stream,
        temperature: None,
    };

    let cache_key = if conf.enable_llm_cache {
        let key = LlmCache::cache_key(
            messages,
            system_prompt,
            &profile.model_name,
            conf.enable_thinking,
        );
        if let Some(entry) = services.llm_cache.lookup(&key) {
            debug!(key = %key, "LLM cache hit; replaying");
            return Ok(services
                .llm_cache
                .replay(&entry, &services.bus, conf.stream, &ctx.cancel)
                .await);
        }
        Some(key)
    } else {
        None
    };

    let provider = services.provider(profile.clone());
    let assistant = match collect_stream(
        provider.as_ref(),
        &req,
        Some(services.bus.as_ref()),
        &ctx.cancel,
    )
    .await
    {
        Ok(assistant) => assistant,
        Err(e) => {
            services.bus.emit(
                "session:error",
                json!({
                    "type": "llm",
                    "error": { "code": e.code(), "message": e.to_string() },
                }),
            );
            return Err(e.into());
        }
    };

    if let Some(key) = cache_key {
        if !ctx.cancel.is_cancelled() && !assistant.has_tool_use() && !assistant.text().is_empty() {
            services.llm_cache.store(CachedCompletion {
                key,
                text: assistant.text(),
                thinking: match assistant.thinking() {
                    t if t.is_empty() => None,
                    t => Some(t),
                },
                model: profile.name.clone(),
                created_at: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    Ok(assistant)
}

fn emit_message_complete(
    services: &Services,
    ctx: &AgentContext,
    assistant: &AssistantMessage,
    uses: &[ToolUseRequest],
) {
    let text = assistant.text();
    let content = if text.is_empty() && uses.is_empty() {
        NO_CONTENT_MESSAGE.to_string()
    } else {
        text
    };
    let tool_calls: Vec<serde_json::Value> = uses
        .iter()
        .map(|u| json!({ "id": u.id, "name": u.name, "input": u.input }))
        .collect();
    services.bus.emit(
        "message:complete",
        json!({
            "agentId": ctx.agent_id,
            "reasoning": assistant.thinking(),
            "content": content,
            "hasToolCalls": !uses.is_empty(),
            "toolCalls": tool_calls,
        }),
    );
}

/// Usage snapshot derived from the newest authoritative assistant message.
fn emit_conversation_usage(services: &Services, ctx: &AgentContext, messages: &[Message]) {
    let Some(profile) = services.models.profile_for(ctx.model_pointer) else {
        return;
    };
    let usage = messages
        .iter()
        .rev()
        .find_map(|m| {
            m.as_assistant()
                .filter(|a| a.usage.is_authoritative())
                .map(|a| a.usage.clone())
        })
        .unwrap_or(Usage::default());
    services.bus.emit(
        "conversation:usage",
        json!({
            "usage": {
                "useTokens": usage.context_tokens() + usage.output_tokens,
                "maxTokens": profile.context_length,
                "promptTokens": usage.input_tokens,
            }
        }),
    );
}

// ─── Test fixture ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use skald_config::{ConfigManager, CoreConfig, EnginePaths, ProjectStore};
    use skald_events::EventBus;
    use skald_model::{ModelManager, ModelPointer, ScriptedProvider, StreamEvent};
    use skald_state::StateManager;
    use skald_tools::{SkillRegistry, ToolRegistry};

    use super::Services;
    use crate::permission::{PermissionEngine, ProviderFactory};

    /// Assemble a fully wired `Services` whose every model call is served
    /// by one shared scripted provider.
    pub(crate) async fn services_with(
        scripts: Vec<Vec<StreamEvent>>,
    ) -> (tempfile::TempDir, Arc<Services>) {
        services_with_tools(scripts, ToolRegistry::new()).await
    }

    pub(crate) async fn services_with_tools(
        scripts: Vec<Vec<StreamEvent>>,
        base_tools: ToolRegistry,
    ) -> (tempfile::TempDir, Arc<Services>) {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("proj");
        std::fs::create_dir_all(&working_dir).unwrap();
        let paths = EnginePaths::with_root(dir.path().join("data"));

        let bus = Arc::new(EventBus::new());
        let state = Arc::new(StateManager::new(Arc::clone(&bus), None));
        let config = Arc::new(ConfigManager::new(CoreConfig::default()));
        let models = Arc::new(ModelManager::load(paths.models_file()));
        models
            .add_profile(ScriptedProvider::mock_profile(), true)
            .await
            .unwrap();
        models
            .set_pointer(ModelPointer::Main, "scripted-mock[mock]")
            .unwrap();
        let projects = Arc::new(ProjectStore::load(paths.projects_file()));

        let provider: Arc<dyn skald_model::ModelProvider> =
            Arc::new(ScriptedProvider::new(scripts));
        let factory: ProviderFactory = Arc::new(move |_profile| Arc::clone(&provider));

        let permissions = Arc::new(PermissionEngine::new(
            Arc::clone(&bus),
            Arc::clone(&config),
            Arc::clone(&state),
            Arc::clone(&projects),
            Arc::clone(&models),
            Arc::clone(&factory),
            working_dir.clone(),
        ));

        let services = Arc::new(Services {
            bus,
            state,
            config,
            models,
            projects,
            mcp: Arc::new(skald_mcp::McpManager::new(&paths, &working_dir)),
            llm_cache: Arc::new(skald_model::LlmCache::new(paths.llm_cache_file())),
            permissions,
            skills: Arc::new(SkillRegistry::new()),
            provider_factory: factory,
            base_tools,
            working_dir,
            paths,
        });
        (dir, services)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::Value;

    use skald_model::{ScriptedProvider, StreamEvent};
    use skald_tools::{Tool, ToolOutput, ToolRegistry};

    use super::testing::{services_with, services_with_tools};
    use super::*;

    struct EchoTool {
        read_only: bool,
        delay_ms: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}},
                   "required": ["text"]})
        }
        fn is_read_only(&self) -> bool {
            self.read_only
        }
        async fn invoke(&self, input: &Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let text = input["text"].as_str().unwrap_or_default().to_string();
            self.log.lock().unwrap().push(text.clone());
            Ok(ToolOutput::text(format!("echo: {text}")))
        }
    }

    fn main_ctx(services: &Arc<Services>) -> AgentContext {
        AgentContext {
            agent_id: MAIN_AGENT_ID.to_string(),
            cancel: CancelHandle::new(),
            tools: services.base_tools.clone(),
            model_pointer: ModelPointer::Main,
        }
    }

    #[tokio::test]
    async fn text_only_turn_finalizes_history_and_emits_complete() {
        let (_dir, services) =
            services_with(vec![ScriptedProvider::text_script("final answer")]).await;
        let completes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completes);
        services.bus.on("message:complete", move |payload| {
            assert_eq!(payload["content"], "final answer");
            assert_eq!(payload["hasToolCalls"], false);
            c.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = main_ctx(&services);
        let history = query(
            &services,
            &ctx,
            vec![Message::user_text("question")],
            vec!["system".into()],
        )
        .await
        .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        let stored = services
            .state
            .for_agent(MAIN_AGENT_ID)
            .get_message_history();
        assert_eq!(stored.len(), 2);
        assert_eq!(
            services.state.for_agent(MAIN_AGENT_ID).current_state(),
            skald_state::AgentPhase::Idle
        );
    }

    #[tokio::test]
    async fn tool_round_trip_pairs_results_and_recurses() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool {
            read_only: true,
            delay_ms: 0,
            log: Arc::clone(&log),
        }));
        let (_dir, services) = services_with_tools(
            vec![
                ScriptedProvider::tool_use_script("tu_1", "Echo", r#"{"text":"ping"}"#),
                ScriptedProvider::text_script("done"),
            ],
            tools,
        )
        .await;

        let ctx = main_ctx(&services);
        let history = query(
            &services,
            &ctx,
            vec![Message::user_text("run echo")],
            vec![],
        )
        .await
        .unwrap();

        // user, assistant(tool_use), user(tool_result), assistant(text)
        assert_eq!(history.len(), 4);
        let results = &history[2];
        assert!(results.is_tool_result_message());
        match &results.content()[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(content.as_str().unwrap(), "echo: ping");
                assert!(!is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(log.lock().unwrap().as_slice(), ["ping"]);
        assert_eq!(history[3].plain_text(), "done");
    }

    #[tokio::test]
    async fn missing_tool_yields_error_result_and_loop_continues() {
        let (_dir, services) = services_with(vec![
            ScriptedProvider::tool_use_script("tu_1", "Ghost", "{}"),
            ScriptedProvider::text_script("recovered"),
        ])
        .await;
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        services.bus.on("tool:execution:error", move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = main_ctx(&services);
        let history = query(&services, &ctx, vec![Message::user_text("go")], vec![])
            .await
            .unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        match &history[2].content()[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                assert!(is_error);
                assert!(content.as_str().unwrap().contains("No such tool"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(history[3].plain_text(), "recovered");
    }

    #[tokio::test]
    async fn pre_cancelled_turn_interrupts_without_touching_tools() {
        let (_dir, services) =
            services_with(vec![ScriptedProvider::tool_use_script("tu_1", "Echo", "{}")]).await;
        let interrupts = Arc::new(AtomicUsize::new(0));
        let i = Arc::clone(&interrupts);
        services.bus.on("session:interrupted", move |_| {
            i.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = main_ctx(&services);
        ctx.cancel.cancel();
        let history = query(&services, &ctx, vec![Message::user_text("go")], vec![])
            .await
            .unwrap();

        assert_eq!(interrupts.load(Ordering::SeqCst), 1);
        // The partial assistant's tool use is answered so pairing holds.
        let last = history.last().unwrap();
        assert!(last
            .content()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. })));
        assert!(last
            .content()
            .iter()
            .any(|b| matches!(b, ContentBlock::Text { text } if text == INTERRUPT_MESSAGE)));
    }

    #[tokio::test]
    async fn read_only_batch_runs_concurrently() {
        // Two echo calls, each sleeping 80ms.  Concurrent execution keeps
        // the whole batch well under the serial 160ms.
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool {
            read_only: true,
            delay_ms: 80,
            log: Arc::clone(&log),
        }));
        let (_dir, services) = services_with_tools(
            vec![
                vec![
                    StreamEvent::ToolUseStart {
                        index: 0,
                        id: "tu_a".into(),
                        name: "Echo".into(),
                    },
                    StreamEvent::ToolUseDelta {
                        index: 0,
                        partial_json: r#"{"text":"a"}"#.into(),
                    },
                    StreamEvent::ToolUseStart {
                        index: 1,
                        id: "tu_b".into(),
                        name: "Echo".into(),
                    },
                    StreamEvent::ToolUseDelta {
                        index: 1,
                        partial_json: r#"{"text":"b"}"#.into(),
                    },
                    StreamEvent::Done,
                ],
                ScriptedProvider::text_script("done"),
            ],
            tools,
        )
        .await;

        let ctx = main_ctx(&services);
        let started = std::time::Instant::now();
        let history = query(&services, &ctx, vec![Message::user_text("go")], vec![])
            .await
            .unwrap();
        assert!(
            started.elapsed() < std::time::Duration::from_millis(160),
            "read-only batch must overlap"
        );

        // Result order matches tool-use order regardless of completion order.
        let blocks = history[2].content();
        match (&blocks[0], &blocks[1]) {
            (
                ContentBlock::ToolResult { tool_use_id: a, .. },
                ContentBlock::ToolResult { tool_use_id: b, .. },
            ) => {
                assert_eq!(a, "tu_a");
                assert_eq!(b, "tu_b");
            }
            other => panic!("unexpected blocks: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_model_emits_no_models_event_and_errors() {
        let (_dir, services) = services_with(vec![]).await;
        let empty_dir = tempfile::tempdir().unwrap();
        let unconfigured = Arc::new(Services {
            bus: Arc::clone(&services.bus),
            state: Arc::clone(&services.state),
            config: Arc::clone(&services.config),
            models: Arc::new(ModelManager::load(empty_dir.path().join("models.json"))),
            projects: Arc::clone(&services.projects),
            mcp: Arc::clone(&services.mcp),
            llm_cache: Arc::clone(&services.llm_cache),
            permissions: Arc::clone(&services.permissions),
            skills: Arc::clone(&services.skills),
            provider_factory: Arc::clone(&services.provider_factory),
            base_tools: services.base_tools.clone(),
            working_dir: services.working_dir.clone(),
            paths: services.paths.clone(),
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        unconfigured.bus.on("config:no_models", move |payload| {
            assert!(payload["message"].as_str().unwrap().contains("No model"));
            f.fetch_add(1, Ordering::SeqCst);
        });

        let ctx = main_ctx(&unconfigured);
        let err = query(&unconfigured, &ctx, vec![Message::user_text("hi")], vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no model configured"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
