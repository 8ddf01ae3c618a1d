// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Classified adapter failure.  The `code()` string is what travels in
/// `session:error` payloads; user cancellation never becomes one of these.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("context too long: {0}")]
    ContextTooLong(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

/// Substrings that identify a context-window overflow in provider error
/// bodies.  Providers phrase this differently; all known variants mention
/// one of these.
const CONTEXT_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "prompt is too long",
    "maximum context length",
    "exceeds the context window",
    "input length and `max_tokens` exceed context limit",
];

impl ModelError {
    /// Classify a non-2xx HTTP response.
    pub fn from_status(status: u16, body: String) -> Self {
        let lowered = body.to_lowercase();
        if CONTEXT_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Self::ContextTooLong(body);
        }
        match status {
            401 | 403 => Self::Auth(body),
            429 => Self::RateLimit(body),
            _ => Self::Api {
                status,
                message: body,
            },
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }

    /// Stable error code for `session:error` payloads.
    pub fn code(&self) -> String {
        match self {
            Self::Api { status, .. } => format!("API_ERROR_{status}"),
            Self::Auth(_) => "AUTH_ERROR".to_string(),
            Self::RateLimit(_) => "RATE_LIMIT".to_string(),
            Self::ContextTooLong(_) => "CONTEXT_TOO_LONG".to_string(),
            Self::Network(_) => "NETWORK_ERROR".to_string(),
            Self::Other(_) => "MODEL_ERROR".to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
