// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::error::ModelError;
use crate::profile::ModelProfile;
use crate::provider::{EventStream, ModelProvider, StreamEvent};
use crate::types::{AdapterRequest, StopReason, Usage};

/// Pre-scripted provider for deterministic tests.  Each `open_stream` call
/// pops the next event script; when the queue runs dry a canned text reply
/// is returned.  The last request is retained for inspection.
pub struct ScriptedProvider {
    profile: ModelProfile,
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    pub last_request: Arc<Mutex<Option<AdapterRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            profile: Self::mock_profile(),
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mock_profile() -> ModelProfile {
        ModelProfile {
            name: "scripted-mock[mock]".into(),
            provider: "mock".into(),
            model_name: "scripted-mock".into(),
            base_url: None,
            api_key: "test".into(),
            max_tokens: 4096,
            context_length: 100_000,
            adapt: Some(crate::Dialect::Openai),
        }
    }

    /// Provider that answers every call with one text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Script fragment: usage + a text reply + done.
    pub fn text_script(reply: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Usage(Usage {
                input_tokens: 25,
                output_tokens: 5,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            }),
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::StopReason(StopReason::EndTurn),
            StreamEvent::Done,
        ]
    }

    /// Script fragment: one complete tool-use block.
    pub fn tool_use_script(id: &str, name: &str, args_json: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Usage(Usage {
                input_tokens: 30,
                output_tokens: 10,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            }),
            StreamEvent::ToolUseStart {
                index: 0,
                id: id.into(),
                name: name.into(),
            },
            StreamEvent::ToolUseDelta {
                index: 0,
                partial_json: args_json.into(),
            },
            StreamEvent::StopReason(StopReason::ToolUse),
            StreamEvent::Done,
        ]
    }

    /// Two-round script: a tool call, then a final text reply.
    pub fn tool_then_text(id: &str, name: &str, args_json: &str, final_text: &str) -> Self {
        Self::new(vec![
            Self::tool_use_script(id, name, args_json),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    async fn open_stream(&self, req: &AdapterRequest) -> Result<EventStream, ModelError> {
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(req.clone());
        let events = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            if scripts.is_empty() {
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamEvent, ModelError>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::types::Message;

    fn request() -> AdapterRequest {
        AdapterRequest {
            messages: vec![Message::user_text("hi")],
            ..AdapterRequest::default()
        }
    }

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let p = ScriptedProvider::new(vec![
            ScriptedProvider::text_script("one"),
            ScriptedProvider::text_script("two"),
        ]);
        for expected in ["one", "two"] {
            let mut s = p.open_stream(&request()).await.unwrap();
            let mut text = String::new();
            while let Some(Ok(ev)) = s.next().await {
                if let StreamEvent::TextDelta(t) = ev {
                    text.push_str(&t);
                }
            }
            assert_eq!(text, expected);
        }
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let p = ScriptedProvider::new(vec![]);
        let mut s = p.open_stream(&request()).await.unwrap();
        let mut saw_fallback = false;
        while let Some(Ok(ev)) = s.next().await {
            if let StreamEvent::TextDelta(t) = ev {
                saw_fallback = t.contains("no more scripts");
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn last_request_is_recorded() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.open_stream(&request()).await.unwrap();
        let recorded = p.last_request.lock().unwrap();
        assert_eq!(recorded.as_ref().unwrap().messages.len(), 1);
    }
}
