// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios for the engine facade, driven entirely through the
/// event bus and a scripted model provider — no network access anywhere.
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use skald::{AgentMode, Engine, EngineOptions, Message, ModelPointer};
use skald_config::EnginePaths;
use skald_core::constants::{CANCEL_MESSAGE, REJECT_MESSAGE};
use skald_core::ProviderFactory;
use skald_model::{
    AssistantMessage, ContentBlock, ModelProvider, ScriptedProvider, StopReason, StreamEvent,
    Usage,
};
use skald_state::{JsonSessionStore, SavedSession, SessionStore};

struct Fixture {
    _dir: tempfile::TempDir,
    working_dir: PathBuf,
    paths: EnginePaths,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("proj");
        std::fs::create_dir_all(&working_dir).unwrap();
        let paths = EnginePaths::with_root(dir.path().join("data"));
        Self {
            _dir: dir,
            working_dir,
            paths,
        }
    }

    async fn engine(&self, scripts: Vec<Vec<StreamEvent>>) -> Engine {
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedProvider::new(scripts));
        let factory: ProviderFactory = Arc::new(move |_profile| Arc::clone(&provider));
        let engine = Engine::new(
            EngineOptions::new(&self.working_dir)
                .with_paths(self.paths.clone())
                .with_provider_factory(factory),
        )
        .await
        .unwrap();
        engine
            .models()
            .add_profile(ScriptedProvider::mock_profile(), true)
            .await
            .unwrap();
        engine
            .models()
            .set_pointer(ModelPointer::Main, "scripted-mock[mock]")
            .unwrap();
        engine
    }
}

/// Record every payload emitted on a topic.
fn record(engine: &Engine, topic: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.bus().on(topic, move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });
    seen
}

fn count(engine: &Engine, topic: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    engine.bus().on(topic, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    counter
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn session_ready_fires_once_with_working_dir() {
    let fx = Fixture::new();
    let engine = fx.engine(vec![]).await;
    let ready = record(&engine, "session:ready");
    let sid = engine.create_session(None).await.unwrap();

    let events = ready.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["sessionId"], sid.as_str());
    assert_eq!(events[0]["historyLoaded"], false);
    assert_eq!(
        events[0]["workingDir"],
        fx.working_dir.to_string_lossy().as_ref()
    );
}

#[tokio::test]
async fn clear_command_empties_history_and_emits_cleared() {
    let fx = Fixture::new();
    let engine = fx
        .engine(vec![ScriptedProvider::text_script("hello there")])
        .await;
    engine.create_session(None).await.unwrap();
    engine.process_user_input("hi", None).await.unwrap();
    assert_eq!(engine.message_history().len(), 2);

    let cleared = count(&engine, "session:cleared");
    engine.process_user_input("/clear", None).await.unwrap();
    assert!(engine.message_history().is_empty());
    assert_eq!(cleared.load(Ordering::SeqCst), 1);
}

// ── S1: round-trip read ───────────────────────────────────────────────────────

#[tokio::test]
async fn s1_round_trip_read() {
    let fx = Fixture::new();
    let package_json = fx.working_dir.join("package.json");
    std::fs::write(&package_json, "{\n  \"name\": \"demo\"\n}\n").unwrap();

    let engine = fx
        .engine(vec![
            ScriptedProvider::tool_use_script(
                "tu_1",
                "Read",
                &json!({"file_path": package_json.to_string_lossy()}).to_string(),
            ),
            ScriptedProvider::text_script("That file declares the demo package."),
        ])
        .await;
    engine.create_session(None).await.unwrap();

    let completes = record(&engine, "tool:execution:complete");
    let states = record(&engine, "state:update");
    engine
        .process_user_input("show me package.json", None)
        .await
        .unwrap();

    let completes = completes.lock().unwrap();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0]["title"], "package.json");
    assert_eq!(completes[0]["toolName"], "Read");

    let history = engine.message_history();
    assert_eq!(history.len(), 4);
    assert!(history[3]
        .plain_text()
        .contains("declares the demo package"));
    assert_eq!(
        states.lock().unwrap().last().unwrap()["state"],
        "idle",
        "turn must end idle"
    );
}

// ── S2: concurrent read batch keeps result order ──────────────────────────────

#[tokio::test]
async fn s2_concurrent_read_batch_preserves_order() {
    let fx = Fixture::new();
    std::fs::write(fx.working_dir.join("a.rs"), "fn a() {}\n").unwrap();

    let file = fx.working_dir.join("a.rs");
    let engine = fx
        .engine(vec![
            vec![
                StreamEvent::ToolUseStart {
                    index: 0,
                    id: "tu_read".into(),
                    name: "Read".into(),
                },
                StreamEvent::ToolUseDelta {
                    index: 0,
                    partial_json: json!({"file_path": file.to_string_lossy()}).to_string(),
                },
                StreamEvent::ToolUseStart {
                    index: 1,
                    id: "tu_glob".into(),
                    name: "Glob".into(),
                },
                StreamEvent::ToolUseDelta {
                    index: 1,
                    partial_json: r#"{"pattern":"**/*.rs"}"#.into(),
                },
                StreamEvent::ToolUseStart {
                    index: 2,
                    id: "tu_grep".into(),
                    name: "Grep".into(),
                },
                StreamEvent::ToolUseDelta {
                    index: 2,
                    partial_json: r#"{"pattern":"fn a"}"#.into(),
                },
                StreamEvent::StopReason(StopReason::ToolUse),
                StreamEvent::Done,
            ],
            ScriptedProvider::text_script("all three done"),
        ])
        .await;
    engine.create_session(None).await.unwrap();
    engine.process_user_input("inspect", None).await.unwrap();

    let history = engine.message_history();
    let results = &history[2];
    let ids: Vec<&str> = results
        .content()
        .iter()
        .map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
            other => panic!("expected tool result, got {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec!["tu_read", "tu_glob", "tu_grep"]);
}

// ── S3: bash permission persistence ───────────────────────────────────────────

#[tokio::test]
async fn s3_bash_allow_persists_prefix_grant() {
    let fx = Fixture::new();
    let engine = fx
        .engine(vec![
            ScriptedProvider::tool_use_script("tu_1", "Bash", r#"{"command":"npm run test"}"#),
            ScriptedProvider::text_script("npm run"), // prefix extraction
            ScriptedProvider::text_script("test run finished"),
            ScriptedProvider::tool_use_script("tu_2", "Bash", r#"{"command":"npm run test"}"#),
            ScriptedProvider::text_script("second run finished"),
        ])
        .await;
    engine.create_session(None).await.unwrap();

    let requests = count(&engine, "tool:permission:request");
    let bus = Arc::clone(engine.bus());
    engine.bus().on("tool:permission:request", move |payload| {
        let tool = payload["toolName"].as_str().unwrap().to_string();
        bus.emit(
            "tool:permission:response",
            json!({"toolName": tool, "selected": "allow"}),
        );
    });

    engine.process_user_input("run the tests", None).await.unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // Identical command in the same project: no further prompt.
    engine
        .process_user_input("run them again", None)
        .await
        .unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

// ── S4: refuse vs. cancel ─────────────────────────────────────────────────────

#[tokio::test]
async fn s4_refuse_yields_reject_message_without_interrupt() {
    let fx = Fixture::new();
    let target = fx.working_dir.join("out.txt");
    let engine = fx
        .engine(vec![ScriptedProvider::tool_use_script(
            "tu_1",
            "Write",
            &json!({"file_path": target.to_string_lossy(), "content": "data"}).to_string(),
        )])
        .await;
    engine.create_session(None).await.unwrap();

    let interrupted = count(&engine, "session:interrupted");
    let bus = Arc::clone(engine.bus());
    engine.bus().on("tool:permission:request", move |payload| {
        let tool = payload["toolName"].as_str().unwrap().to_string();
        bus.emit(
            "tool:permission:response",
            json!({"toolName": tool, "selected": "refuse"}),
        );
    });

    engine.process_user_input("write the file", None).await.unwrap();

    let history = engine.message_history();
    // user, assistant(tool_use), user(tool_result) — no further recursion.
    assert_eq!(history.len(), 3);
    match &history[2].content()[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(is_error);
            assert_eq!(content.as_str().unwrap(), REJECT_MESSAGE);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!target.exists(), "refused write must not touch the file");
    assert_eq!(interrupted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s4_interrupt_yields_cancel_message_and_interrupt_event() {
    let fx = Fixture::new();
    let engine = Arc::new(
        fx.engine(vec![
            ScriptedProvider::tool_use_script("tu_1", "Bash", r#"{"command":"sleep 30"}"#),
            ScriptedProvider::text_script("sleep"), // prefix extraction
        ])
        .await,
    );
    engine.create_session(None).await.unwrap();
    let interrupted = count(&engine, "session:interrupted");

    // Nobody answers the permission prompt; the user interrupts instead.
    let interrupter = Arc::clone(&engine);
    engine.bus().on("tool:permission:request", move |_| {
        interrupter.interrupt_session();
    });

    engine.process_user_input("sleep a while", None).await.unwrap();

    let history = engine.message_history();
    match &history[2].content()[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(is_error);
            assert!(content.as_str().unwrap().contains(CANCEL_MESSAGE));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(interrupted.load(Ordering::SeqCst), 1);
}

// ── S5: plan-mode exit with clear-context ─────────────────────────────────────

#[tokio::test]
async fn s5_plan_exit_clear_context_restarts_history() {
    let fx = Fixture::new();
    let engine = fx
        .engine(vec![
            ScriptedProvider::tool_use_script(
                "tu_1",
                "ExitPlanMode",
                &json!({"planFilePath": "/proj/plan.md", "planContent": "# The Plan"}).to_string(),
            ),
            ScriptedProvider::text_script("starting implementation"),
        ])
        .await;
    engine.create_session(None).await.unwrap();
    engine.update_agent_mode(AgentMode::Plan);

    let implement = record(&engine, "plan:implement");
    let bus = Arc::clone(engine.bus());
    engine.bus().on("plan:exit:request", move |payload| {
        assert_eq!(payload["planContent"], "# The Plan");
        let agent = payload["agentId"].as_str().unwrap().to_string();
        bus.emit(
            "plan:exit:response",
            json!({"agentId": agent, "selected": "clearContextAndStart"}),
        );
    });

    engine
        .process_user_input("the plan is ready", None)
        .await
        .unwrap();

    assert_eq!(engine.config().agent_mode(), AgentMode::Agent);
    let implement = implement.lock().unwrap();
    assert_eq!(implement.len(), 1);
    assert_eq!(implement[0]["planFilePath"], "/proj/plan.md");

    // The cleared-and-restarted history: one user kickoff message plus the
    // assistant reply from the rebuilt context.
    let history = engine.message_history();
    assert_eq!(history.len(), 2);
    assert!(history[0]
        .plain_text()
        .contains("Implement the following plan:\n\n# The Plan"));
    assert_eq!(history[1].plain_text(), "starting implementation");
}

// ── S6: auto-compaction ───────────────────────────────────────────────────────

fn assistant_with_usage(text: &str, input_tokens: u64) -> Message {
    Message::Assistant(AssistantMessage {
        content: vec![ContentBlock::text(text)],
        uuid: uuid_like(text),
        model: "scripted-mock[mock]".into(),
        usage: Usage {
            input_tokens,
            output_tokens: 50,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
        stop_reason: Some(StopReason::EndTurn),
        duration_ms: 5,
    })
}

fn uuid_like(seed: &str) -> String {
    format!("fixed-{seed}")
}

#[tokio::test]
async fn s6_auto_compact_triggers_and_shrinks_usage() {
    let fx = Fixture::new();

    // Seed a saved session whose last assistant reports 80% of the mock
    // context window (100k).
    let store = JsonSessionStore::new(fx.paths.clone());
    let saved = SavedSession {
        messages: vec![
            Message::user_text("old question one"),
            assistant_with_usage("old answer one", 10_000),
            Message::user_text("old question two"),
            assistant_with_usage("old answer two", 80_000),
        ],
        todos: Vec::new(),
    };
    store.save("big-session", &saved).unwrap();

    let engine = fx
        .engine(vec![
            ScriptedProvider::text_script("1. Primary Request and Intent: demo summary"),
            ScriptedProvider::text_script("continuing with fresh context"),
        ])
        .await;
    let compacts = record(&engine, "compact:exec");
    let usages = record(&engine, "conversation:usage");

    engine
        .create_session(Some("big-session".to_string()))
        .await
        .unwrap();
    engine.process_user_input("keep going", None).await.unwrap();

    let compacts = compacts.lock().unwrap();
    assert_eq!(compacts.len(), 1);
    assert_eq!(compacts[0]["tokenBefore"], 80_000);
    assert!(compacts[0]["compactRate"].as_f64().unwrap() < 1.0);

    let usages = usages.lock().unwrap();
    let max_use = usages
        .iter()
        .map(|u| u["usage"]["useTokens"].as_u64().unwrap())
        .max()
        .unwrap();
    assert!(
        max_use < 80_000,
        "post-compaction usage must be below the seeded 80k, got {max_use}"
    );

    // The compacted history carries the summary, not the old turns.
    let history = engine.message_history();
    assert!(history
        .iter()
        .any(|m| m.plain_text().contains("demo summary")));
    assert!(!history.iter().any(|m| m.plain_text() == "old answer one"));
}

// ── Property: usage events are well-formed across turns ───────────────────────

#[tokio::test]
async fn conversation_usage_reports_context_length() {
    let fx = Fixture::new();
    let engine = fx
        .engine(vec![ScriptedProvider::text_script("short answer")])
        .await;
    engine.create_session(None).await.unwrap();
    let usages = record(&engine, "conversation:usage");
    engine.process_user_input("q", None).await.unwrap();

    let usages = usages.lock().unwrap();
    assert!(!usages.is_empty());
    for usage in usages.iter() {
        assert_eq!(usage["usage"]["maxTokens"], 100_000);
        assert!(usage["usage"]["useTokens"].as_u64().is_some());
    }
}
