// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! skald — an embeddable core engine for AI coding agents.
//!
//! The engine drives an agent loop: it streams assistant messages from a
//! configured LLM, executes requested tools (file I/O, shell, search,
//! subagents), feeds the results back, and repeats until the model stops
//! calling tools.  Consumers embed it behind an event-driven API: UIs
//! subscribe to streaming events on the [`EventBus`] and answer
//! permission/question prompts by emitting the matching `*:response`
//! topics.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use skald::{Engine, EngineOptions};
//!
//! let engine = Engine::new(EngineOptions::new("/path/to/project")).await?;
//! engine.create_session(None).await?;
//! engine.process_user_input("explain the build system", None).await?;
//! # Ok(())
//! # }
//! ```

mod commands;
mod engine;
mod fileref;

pub use commands::SystemCommand;
pub use engine::{Engine, EngineOptions};
pub use fileref::{parse_references, FileReference};

pub use skald_config::{
    AgentMode, ConfigManager, CoreConfig, McpServerConfig, McpTransport, ProjectConfig,
};
pub use skald_core::{AgentRegistry, SubagentConfig};
pub use skald_events::{CancelHandle, EventBus};
pub use skald_model::{
    ContentBlock, Message, ModelPointer, ModelProfile, StopReason, Usage,
};
pub use skald_state::{AgentPhase, TodoItem, TodoStatus, MAIN_AGENT_ID};
pub use skald_tools::{SkillEntry, Tool};
