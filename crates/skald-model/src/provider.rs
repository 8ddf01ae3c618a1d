// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ModelError;
use crate::profile::{Dialect, ModelProfile};
use crate::types::{AdapterRequest, StopReason, Usage};
use crate::{AnthropicProvider, OpenAiCompatProvider};

/// One event from a streaming completion, already normalized across
/// dialects.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    /// Opaque integrity signature attached to a thinking block.
    ThinkingSignature(String),
    /// A tool-use block opened.  `id`/`name` may be empty for dialects that
    /// deliver them separately from the argument fragments.
    ToolUseStart {
        index: u32,
        id: String,
        name: String,
    },
    /// A fragment of a tool-use input's JSON arguments.
    ToolUseDelta {
        index: u32,
        partial_json: String,
    },
    Usage(Usage),
    StopReason(StopReason),
    Done,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

/// A streaming completion endpoint.  Implemented by the two HTTP dialects
/// and by the scripted mock used in tests.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn profile(&self) -> &ModelProfile;

    /// Open a streaming completion.  The returned stream yields normalized
    /// events until `Done`.
    async fn open_stream(&self, req: &AdapterRequest) -> Result<EventStream, ModelError>;
}

/// Construct the HTTP provider matching a profile's dialect.
pub fn provider_for(profile: ModelProfile) -> Arc<dyn ModelProvider> {
    match profile.dialect() {
        Dialect::Anthropic => Arc::new(AnthropicProvider::new(profile)),
        Dialect::Openai => Arc::new(OpenAiCompatProvider::new(profile)),
    }
}

/// Drain every complete `\n`-terminated line out of `buf`, leaving any
/// trailing partial line in place.  SSE frames are routinely split across
/// TCP chunks, so both dialects re-assemble lines through this buffer.
pub(crate) fn drain_sse_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        lines.push(line);
    }
    lines
}

/// Extract the payload of a `data:` SSE line; `None` for blanks, comments
/// and other fields.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
