// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod accumulate;
mod anthropic;
mod cache;
mod error;
mod mock;
mod openai;
mod profile;
mod provider;
mod registry;
mod types;

pub use accumulate::collect_stream;
pub use anthropic::AnthropicProvider;
pub use cache::{CachedCompletion, LlmCache, LLM_CACHE_MAX_ENTRIES};
pub use error::ModelError;
pub use mock::ScriptedProvider;
pub use openai::OpenAiCompatProvider;
pub use profile::{Dialect, ModelPointer, ModelProfile};
pub use provider::{provider_for, EventStream, ModelProvider, StreamEvent};
pub use registry::{ModelManager, ModelStore};
pub use types::{
    strip_stale_usage, AdapterRequest, AssistantMessage, ContentBlock, ControlSignal, Message,
    RebuildContextSignal, StopReason, ToolSchema, Usage, UserMessage,
};
