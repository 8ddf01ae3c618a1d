// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Which of the two configured model slots a request should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPointer {
    /// Primary model driving the conversation loop.
    Main,
    /// Small/fast model for auxiliary calls (bash prefix extraction,
    /// subagents configured for it).
    Quick,
}

impl ModelPointer {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Quick => "quick",
        }
    }
}

/// Wire dialect spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Anthropic,
    Openai,
}

/// A configured model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfile {
    /// Registry key, always `"{modelName}[{provider}]"`.
    pub name: String,
    pub provider: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub api_key: String,
    pub max_tokens: u32,
    pub context_length: u64,
    /// Explicit dialect override; when absent the provider/model table
    /// decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt: Option<Dialect>,
}

impl ModelProfile {
    pub fn display_name(model_name: &str, provider: &str) -> String {
        format!("{model_name}[{provider}]")
    }

    /// Resolve the wire dialect.
    ///
    /// Explicit `adapt` wins; otherwise: provider `anthropic` speaks
    /// anthropic, OpenRouter routes `anthropic/…` models to the anthropic
    /// dialect, and everything else speaks the OpenAI format.
    pub fn dialect(&self) -> Dialect {
        if let Some(d) = self.adapt {
            return d;
        }
        match self.provider.as_str() {
            "anthropic" => Dialect::Anthropic,
            "openrouter" if self.model_name.starts_with("anthropic/") => Dialect::Anthropic,
            _ => Dialect::Openai,
        }
    }
}

/// Model-name prefixes whose APIs take `max_completion_tokens` instead of
/// `max_tokens`, and reject non-default temperatures.
const MAX_COMPLETION_TOKEN_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

pub(crate) fn uses_max_completion_tokens(model_name: &str) -> bool {
    MAX_COMPLETION_TOKEN_PREFIXES
        .iter()
        .any(|p| model_name.starts_with(p))
}

/// Default sampling temperature for main-loop completions.
pub(crate) const MAIN_TEMPERATURE: f32 = 0.2;

/// Effective temperature for a model: reasoning-model families only accept
/// the default (1.0).
pub(crate) fn temperature_for(model_name: &str, requested: Option<f32>) -> f32 {
    if uses_max_completion_tokens(model_name) {
        return 1.0;
    }
    requested.unwrap_or(MAIN_TEMPERATURE)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
