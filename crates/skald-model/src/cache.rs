// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use skald_config::{read_json, write_json_atomic};
use skald_events::{CancelHandle, EventBus};

use crate::types::{AssistantMessage, ContentBlock, Message, StopReason, Usage};

/// Most-recent entries kept in the cache file.
pub const LLM_CACHE_MAX_ENTRIES: usize = 100;

/// Characters per simulated streaming window during replay.
const REPLAY_WINDOW_CHARS: usize = 64;
/// Pause between replay windows.  Small enough to feel live, large enough
/// that consumers can visibly stream.
const REPLAY_DELAY: Duration = Duration::from_millis(12);

/// One cached completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCompletion {
    pub key: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub model: String,
    pub created_at: i64,
}

/// Content-addressed replay cache stored as a single JSON file, newest
/// entry first.
pub struct LlmCache {
    file: PathBuf,
}

impl LlmCache {
    pub fn new(file: PathBuf) -> Self {
        Self { file }
    }

    /// MD5 over everything that determines a completion: message contents,
    /// system prompt text, model name, and the thinking flag.
    pub fn cache_key(
        messages: &[Message],
        system_prompt: &[String],
        model_name: &str,
        enable_thinking: bool,
    ) -> String {
        let mut hasher = Md5::new();
        for message in messages {
            for block in message.content() {
                // Serialization is infallible for these types.
                if let Ok(text) = serde_json::to_string(block) {
                    hasher.update(text.as_bytes());
                }
            }
        }
        for block in system_prompt {
            hasher.update(block.as_bytes());
        }
        hasher.update(model_name.as_bytes());
        hasher.update(if enable_thinking { b"1" } else { b"0" });
        format!("{:x}", hasher.finalize())
    }

    pub fn lookup(&self, key: &str) -> Option<CachedCompletion> {
        let entries: Vec<CachedCompletion> = read_json(&self.file).ok().flatten()?;
        entries.into_iter().find(|e| e.key == key)
    }

    /// Prepend an entry and truncate to the cap.  Best-effort: a write
    /// failure logs and is otherwise ignored.
    pub fn store(&self, entry: CachedCompletion) {
        let mut entries: Vec<CachedCompletion> =
            read_json(&self.file).ok().flatten().unwrap_or_default();
        entries.retain(|e| e.key != entry.key);
        entries.insert(0, entry);
        entries.truncate(LLM_CACHE_MAX_ENTRIES);
        if let Err(e) = write_json_atomic(&self.file, &entries) {
            warn!(file = %self.file.display(), error = %e, "failed to persist LLM cache");
        }
    }

    /// Rebuild an assistant message from a cache entry, simulating the
    /// original streaming cadence.
    ///
    /// Cancellation stops the replay early without an error: the chunks
    /// emitted so far simply stop and the full cached message is still
    /// returned, mirroring how a real aborted stream yields a partial.
    pub async fn replay(
        &self,
        entry: &CachedCompletion,
        bus: &EventBus,
        emit_chunks: bool,
        cancel: &CancelHandle,
    ) -> AssistantMessage {
        if emit_chunks {
            if let Some(thinking) = &entry.thinking {
                Self::replay_channel(bus, "message:thinking:chunk", thinking, cancel).await;
            }
            Self::replay_channel(bus, "message:text:chunk", &entry.text, cancel).await;
        }
        let mut content = Vec::new();
        if let Some(thinking) = &entry.thinking {
            content.push(ContentBlock::Thinking {
                text: thinking.clone(),
                signature: None,
            });
        }
        content.push(ContentBlock::text(entry.text.clone()));
        AssistantMessage {
            content,
            uuid: uuid::Uuid::new_v4().to_string(),
            model: entry.model.clone(),
            usage: Usage::default(),
            stop_reason: Some(StopReason::EndTurn),
            duration_ms: 0,
        }
    }

    async fn replay_channel(bus: &EventBus, topic: &str, full: &str, cancel: &CancelHandle) {
        let chars: Vec<char> = full.chars().collect();
        let mut sent = String::with_capacity(full.len());
        for window in chars.chunks(REPLAY_WINDOW_CHARS) {
            if cancel.is_cancelled() {
                break;
            }
            let delta: String = window.iter().collect();
            sent.push_str(&delta);
            bus.emit(topic, json!({ "content": sent, "delta": delta }));
            tokio::time::sleep(REPLAY_DELAY).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
