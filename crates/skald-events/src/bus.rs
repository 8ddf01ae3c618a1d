// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::cancel::CancelHandle;

/// Topics that fire once per streamed token.  Logging every emission would
/// drown the trace output, so these skip the per-emit log line.
const SILENT_TOPICS: &[&str] = &["message:thinking:chunk", "message:text:chunk"];

/// Identifier returned by `on`/`once`, used to unsubscribe with `off`.
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

/// Synchronous publish/subscribe bus keyed by topic name
/// (`namespace:action[:detail]`).
///
/// Delivery runs in subscription order on the emitting task.  A handler
/// that panics is isolated: the panic is caught and logged, the remaining
/// handlers still run, and the emitter never observes the failure.
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a topic.  The handler runs on every emission until `off`.
    pub fn on<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(topic, handler, false)
    }

    /// Subscribe for a single emission; the handler is removed after it runs.
    pub fn once<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(topic, handler, true)
    }

    fn subscribe<F>(&self, topic: &str, handler: F, once: bool) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.entry(topic.to_string()).or_default().push(Subscription {
            id,
            once,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription.  Unknown ids are ignored.
    pub fn off(&self, id: SubscriptionId) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        for subs in topics.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }

    /// Emit a payload to every subscriber of `topic`.
    ///
    /// Returns `true` when at least one handler ran.  `once` subscriptions
    /// are removed before their handler is invoked so that a handler which
    /// re-emits the same topic cannot re-enter itself.
    pub fn emit(&self, topic: &str, payload: Value) -> bool {
        let handlers: Vec<Handler> = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            match topics.get_mut(topic) {
                None => Vec::new(),
                Some(subs) => {
                    let collected: Vec<Handler> =
                        subs.iter().map(|s| Arc::clone(&s.handler)).collect();
                    subs.retain(|s| !s.once);
                    collected
                }
            }
        };

        if !SILENT_TOPICS.contains(&topic) {
            trace!(topic, listeners = handlers.len(), "emit");
        }

        if handlers.is_empty() {
            return false;
        }
        for handler in &handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&payload))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                warn!(topic, error = %msg, "event handler panicked; continuing");
            }
        }
        true
    }

    /// Remove every subscription on every topic.
    pub fn clear(&self) {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Emit `request_topic` and block until a payload arrives on
    /// `response_topic` whose `correlation_field` equals `correlation_value`,
    /// or until `cancel` fires.
    ///
    /// Returns `None` on cancellation.  The response listener is always
    /// removed before returning, so an unanswered request leaves no residue
    /// on the bus.
    pub async fn request(
        &self,
        request_topic: &str,
        response_topic: &str,
        payload: Value,
        correlation_field: &str,
        correlation_value: &str,
        cancel: &CancelHandle,
    ) -> Option<Value> {
        let (tx, rx) = oneshot::channel::<Value>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let field = correlation_field.to_string();
        let expected = correlation_value.to_string();

        let sub_id = self.on(response_topic, {
            let slot = Arc::clone(&slot);
            move |v: &Value| {
                let matches = v
                    .get(&field)
                    .and_then(Value::as_str)
                    .map(|s| s == expected)
                    .unwrap_or(false);
                if !matches {
                    return;
                }
                if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(v.clone());
                }
            }
        });

        self.emit(request_topic, payload);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            resp = rx => resp.ok(),
        };
        self.off(sub_id);
        outcome
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    // ── on / emit ─────────────────────────────────────────────────────────────

    #[test]
    fn emit_without_listeners_returns_false() {
        let bus = EventBus::new();
        assert!(!bus.emit("session:ready", json!({})));
    }

    #[test]
    fn emit_invokes_listener_and_returns_true() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on("state:update", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.emit("state:update", json!({"state": "idle"})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let o = Arc::clone(&order);
            bus.on("t", move |_| o.lock().unwrap().push(n));
        }
        bus.emit("t", json!({}));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn handler_receives_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        bus.on("todos:update", move |v| {
            *s.lock().unwrap() = Some(v.clone());
        });
        bus.emit("todos:update", json!({"todos": [1, 2]}));
        assert_eq!(seen.lock().unwrap().as_ref().unwrap()["todos"][1], 2);
    }

    // ── once / off ────────────────────────────────────────────────────────────

    #[test]
    fn once_listener_fires_exactly_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.once("t", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("t", json!({}));
        bus.emit("t", json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.on("t", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.off(id);
        assert!(!bus.emit("t", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    // ── Panic isolation ───────────────────────────────────────────────────────

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on("t", |_| panic!("boom"));
        let h = Arc::clone(&hits);
        bus.on("t", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.emit("t", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // ── Request / response ────────────────────────────────────────────────────

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let bus = Arc::new(EventBus::new());
        let responder = Arc::clone(&bus);
        bus.on("tool:permission:request", move |v| {
            let tool = v["toolName"].as_str().unwrap().to_string();
            responder.emit(
                "tool:permission:response",
                json!({"toolName": tool, "selected": "agree"}),
            );
        });
        let cancel = CancelHandle::new();
        let resp = bus
            .request(
                "tool:permission:request",
                "tool:permission:response",
                json!({"toolName": "Bash"}),
                "toolName",
                "Bash",
                &cancel,
            )
            .await;
        assert_eq!(resp.unwrap()["selected"], "agree");
    }

    #[tokio::test]
    async fn request_ignores_mismatched_correlation() {
        let bus = Arc::new(EventBus::new());
        let responder = Arc::clone(&bus);
        bus.on("ask:question:request", move |_| {
            // Wrong agent id first, then the right one.
            responder.emit("ask:question:response", json!({"agentId": "other"}));
            responder.emit(
                "ask:question:response",
                json!({"agentId": "main", "answers": {"q": "a"}}),
            );
        });
        let cancel = CancelHandle::new();
        let resp = bus
            .request(
                "ask:question:request",
                "ask:question:response",
                json!({"agentId": "main"}),
                "agentId",
                "main",
                &cancel,
            )
            .await;
        assert_eq!(resp.unwrap()["answers"]["q"], "a");
    }

    #[tokio::test]
    async fn request_returns_none_on_cancel() {
        let bus = EventBus::new();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let resp = bus
            .request(
                "plan:exit:request",
                "plan:exit:response",
                json!({"agentId": "main"}),
                "agentId",
                "main",
                &cancel,
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn request_listener_is_removed_after_completion() {
        let bus = Arc::new(EventBus::new());
        let responder = Arc::clone(&bus);
        bus.on("r:request", move |_| {
            responder.emit("r:response", json!({"agentId": "a"}));
        });
        let cancel = CancelHandle::new();
        let _ = bus
            .request("r:request", "r:response", json!({"agentId": "a"}), "agentId", "a", &cancel)
            .await;
        // A later emission on the response topic must find no listeners.
        assert!(!bus.emit("r:response", json!({"agentId": "a"})));
    }
}
