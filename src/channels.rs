//! Outbound message buffering and inbound channel fan-out.
//!
//! Two pieces:
//!
//! - [`MessageQueue`]: a bounded FIFO of messages accepted while
//!   disconnected. Insertion beyond capacity silently evicts the oldest
//!   entry, an explicit lossy policy for low-priority channels. Flushing
//!   drains strictly in order; delivery is at-most-once per attempt.
//! - [`ChannelRegistry`]: per-channel handler sets with deterministic
//!   subscribe/unsubscribe lifecycle. Handlers are deduplicated by `Arc`
//!   identity and dispatch iterates over a snapshot copy, so handlers may
//!   subscribe or unsubscribe reentrantly without deadlock or
//!   mutation-during-iteration hazards.

use crate::models::envelope::now_ms;
use crate::models::{Envelope, EnvelopeKind};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// ── Pending messages ────────────────────────────────────────────────────────

/// A message accepted for sending while the connection was down.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Destination channel.
    pub channel: String,
    /// Wire message type to emit on flush.
    pub kind: EnvelopeKind,
    /// Opaque payload.
    pub payload: JsonValue,
    /// Millis since Unix epoch when the message was queued.
    pub enqueued_at_ms: u64,
    /// Number of flush attempts this message has survived.
    pub retry_count: u32,
}

impl PendingMessage {
    /// Create a publish message stamped with the current time.
    pub fn new(channel: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            channel: channel.into(),
            kind: EnvelopeKind::Publish,
            payload,
            enqueued_at_ms: now_ms(),
            retry_count: 0,
        }
    }

    /// Queue an arbitrary envelope, preserving its original timestamp.
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            channel: envelope.channel,
            kind: envelope.kind,
            payload: envelope.payload,
            enqueued_at_ms: envelope.timestamp,
            retry_count: 0,
        }
    }

    /// Rebuild the wire envelope, stamped with the original enqueue time.
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            channel: self.channel,
            kind: self.kind,
            payload: self.payload,
            timestamp: self.enqueued_at_ms,
        }
    }
}

/// Bounded FIFO queue of [`PendingMessage`]s, drop-oldest on overflow.
#[derive(Debug)]
pub struct MessageQueue {
    capacity: usize,
    messages: VecDeque<PendingMessage>,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a message. When full, the oldest unsent message is evicted
    /// and returned; no error is raised.
    pub fn push(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    /// Put a message back at the front (undelivered send being requeued).
    pub fn push_front(&mut self, message: PendingMessage) {
        self.messages.push_front(message);
        self.messages.truncate(self.capacity);
    }

    /// The oldest message, without removing it.
    pub fn front(&self) -> Option<&PendingMessage> {
        self.messages.front()
    }

    /// Remove and return the oldest message.
    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    /// Bump the retry counter on every queued message after a failed
    /// flush attempt.
    pub fn mark_retry(&mut self) {
        for message in &mut self.messages {
            message.retry_count += 1;
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── Channel registry ────────────────────────────────────────────────────────

/// Identifier of a registered handler, returned by
/// [`subscribe`](ChannelRegistry::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Event delivered to channel handlers.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    /// Channel the event arrived on.
    pub channel: String,
    /// Opaque payload from the server.
    pub payload: JsonValue,
    /// Server-side timestamp (millis since Unix epoch).
    pub timestamp: u64,
}

/// Callback invoked for each event on a subscribed channel.
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Per-channel handler sets with snapshot-copy dispatch.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, ChannelHandler)>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`, returning its id.
    ///
    /// Deduplicated by `Arc` identity: registering the same handler twice
    /// on one channel returns the existing id without adding a duplicate.
    pub fn subscribe(&self, channel: &str, handler: ChannelHandler) -> HandlerId {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let entries = handlers.entry(channel.to_string()).or_default();

        if let Some((id, _)) = entries.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)) {
            return *id;
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        entries.push((id, handler));
        id
    }

    /// Remove the handler registered under `id` on `channel`.
    /// Returns whether a handler was removed.
    pub fn unsubscribe(&self, channel: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = handlers.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(handler_id, _)| *handler_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(channel);
        }
        removed
    }

    /// Dispatch `event` to every handler on its channel.
    ///
    /// Iterates over a snapshot copy taken under the lock, then invokes
    /// handlers outside it.
    pub fn dispatch(&self, event: ChannelEvent) {
        let snapshot: Vec<ChannelHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&event.channel) {
                Some(entries) => entries.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(event.clone());
        }
    }

    /// Channels with at least one active handler. These are re-subscribed
    /// on every reconnect; the server is assumed stateless across
    /// reconnects.
    pub fn active_channels(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    /// Number of handlers currently registered on `channel`.
    pub fn handler_count(&self, channel: &str) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(channel).map(|entries| entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn message(n: u32) -> PendingMessage {
        PendingMessage::new("tasks", json!({ "n": n }))
    }

    #[test]
    fn test_queue_preserves_fifo_order() {
        let mut queue = MessageQueue::new(8);
        for n in 0..5 {
            queue.push(message(n));
        }
        for n in 0..5 {
            assert_eq!(queue.pop_front().unwrap().payload["n"], n);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_overflow_evicts_oldest() {
        let mut queue = MessageQueue::new(3);
        for n in 0..3 {
            assert!(queue.push(message(n)).is_none());
        }
        let evicted = queue.push(message(3)).expect("oldest should be evicted");
        assert_eq!(evicted.payload["n"], 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front().unwrap().payload["n"], 1);
    }

    #[test]
    fn test_queue_size_never_exceeds_capacity() {
        let mut queue = MessageQueue::new(4);
        for n in 0..20 {
            queue.push(message(n));
            assert!(queue.len() <= 4);
        }
        // The four newest survive.
        assert_eq!(queue.pop_front().unwrap().payload["n"], 16);
    }

    #[test]
    fn test_mark_retry_bumps_all() {
        let mut queue = MessageQueue::new(4);
        queue.push(message(0));
        queue.push(message(1));
        queue.mark_retry();
        queue.mark_retry();
        assert_eq!(queue.front().unwrap().retry_count, 2);
    }

    #[test]
    fn test_registry_dedupes_by_identity() {
        let registry = ChannelRegistry::new();
        let handler: ChannelHandler = Arc::new(|_| {});

        let first = registry.subscribe("tasks", handler.clone());
        let second = registry.subscribe("tasks", handler.clone());
        assert_eq!(first, second);
        assert_eq!(registry.handler_count("tasks"), 1);

        // A distinct closure with identical code is a different handler.
        let other: ChannelHandler = Arc::new(|_| {});
        let third = registry.subscribe("tasks", other);
        assert_ne!(first, third);
        assert_eq!(registry.handler_count("tasks"), 2);
    }

    #[test]
    fn test_unsubscribe_removes_and_empties_channel() {
        let registry = ChannelRegistry::new();
        let handler: ChannelHandler = Arc::new(|_| {});
        let id = registry.subscribe("tasks", handler);

        assert!(registry.unsubscribe("tasks", id));
        assert!(!registry.unsubscribe("tasks", id));
        assert_eq!(registry.handler_count("tasks"), 0);
        assert!(registry.active_channels().is_empty());
    }

    #[test]
    fn test_dispatch_reaches_all_handlers_in_order() {
        let registry = ChannelRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            registry.subscribe(
                "tasks",
                Arc::new(move |event: ChannelEvent| {
                    seen.lock().unwrap().push((tag, event.payload.clone()));
                }),
            );
        }

        registry.dispatch(ChannelEvent {
            channel: "tasks".to_string(),
            payload: json!({"id": "T1"}),
            timestamp: 1,
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "a");
        assert_eq!(seen[1].0, "b");
    }

    #[test]
    fn test_dispatch_ignores_unknown_channel() {
        let registry = ChannelRegistry::new();
        registry.dispatch(ChannelEvent {
            channel: "nobody".to_string(),
            payload: json!(null),
            timestamp: 1,
        });
    }

    #[test]
    fn test_handler_may_unsubscribe_reentrantly() {
        let registry = Arc::new(ChannelRegistry::new());
        let fired = Arc::new(Mutex::new(0usize));

        let registry_inner = registry.clone();
        let fired_inner = fired.clone();
        let id_slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let id_slot_inner = id_slot.clone();

        let handler: ChannelHandler = Arc::new(move |_event| {
            *fired_inner.lock().unwrap() += 1;
            if let Some(id) = *id_slot_inner.lock().unwrap() {
                // Snapshot dispatch: this must not deadlock.
                registry_inner.unsubscribe("tasks", id);
            }
        });
        let id = registry.subscribe("tasks", handler);
        *id_slot.lock().unwrap() = Some(id);

        let event = ChannelEvent {
            channel: "tasks".to_string(),
            payload: json!(null),
            timestamp: 1,
        };
        registry.dispatch(event.clone());
        registry.dispatch(event);

        assert_eq!(*fired.lock().unwrap(), 1, "handler removed itself after first event");
    }
}
