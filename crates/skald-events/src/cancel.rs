// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Reserved cancellation reason used when the user declines a permission
/// request.  Consumers inspect it to distinguish a refused tool call from a
/// plain interrupt — the two produce different tool-result text.
pub const REFUSE_REASON: &str = "refuse";

/// Cooperative cancellation handle shared by one user turn and every
/// subagent spawned during it.
///
/// Wraps a [`CancellationToken`] with an optional reason string.  Cancelling
/// is idempotent; the first reason written wins.  Clones observe the same
/// underlying state.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancel without a reason (generic user interrupt).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel with a reason.  The reason is only recorded on the first
    /// cancellation; later calls keep the original.
    pub fn cancel_with_reason(&self, reason: &str) {
        {
            let mut r = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if r.is_none() {
                *r = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True when the cancellation was a permission refusal.
    pub fn is_refused(&self) -> bool {
        self.is_cancelled() && self.reason().as_deref() == Some(REFUSE_REASON)
    }

    /// Resolve when cancelled.  Usable inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
