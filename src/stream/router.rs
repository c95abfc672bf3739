// =============================================================================
// Message Router — Classify inbound frames and dispatch data to callbacks
// =============================================================================
//
// Inbound text frames are one of:
//   * an operation response  {"op":"auth"|"subscribe"|..., "success":..., "req_id":...}
//   * a heartbeat reply      {"op":"pong"} or {"op":"ping","ret_msg":"pong"}
//   * a data frame           {"topic":"kline.15.BTCUSDT", "data":...}
//
// Data frames are routed by the canonical key of their topic; operation
// responses are handed back to the connection so that it can resolve the
// pending request.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::stream::registry::SubscriptionRegistry;
use crate::stream::topic::Topic;

/// Venue acknowledgement of an operation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlAck {
    pub op: String,
    pub req_id: Option<String>,
    pub success: bool,
    pub message: String,
}

impl ControlAck {
    /// Key under which the matching request waits: the request id when the
    /// venue echoes one, otherwise the operation name.
    pub fn key(&self) -> String {
        match &self.req_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.op.clone(),
        }
    }
}

/// Result of routing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Delivered to the topic's callback.
    Dispatched(Topic),
    /// Data frame whose topic has no callback, or could not be parsed.
    Dropped(String),
    Control(ControlAck),
    Pong,
    /// Not JSON, or JSON of a shape we do not act on.
    Ignored,
}

/// Classification of a frame without side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlAck),
    Pong,
    Data { topic: String, payload: Value },
    Unknown,
}

/// Parse a raw text frame into a [`Frame`].
pub fn classify(text: &str) -> Frame {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Unknown,
    };

    if let Some(topic) = root.get("topic").and_then(Value::as_str) {
        return Frame::Data {
            topic: topic.to_string(),
            payload: root.get("data").cloned().unwrap_or(Value::Null),
        };
    }

    let Some(op) = root.get("op").and_then(Value::as_str) else {
        return Frame::Unknown;
    };
    let ret_msg = root
        .get("ret_msg")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if op == "pong" || (op == "ping" && ret_msg == "pong") {
        return Frame::Pong;
    }

    Frame::Control(ControlAck {
        op: op.to_string(),
        req_id: root
            .get("req_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        success: root
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        message: ret_msg.to_string(),
    })
}

/// Routes data frames into a [`SubscriptionRegistry`].
pub struct MessageRouter {
    registry: Arc<SubscriptionRegistry>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl MessageRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Classify `text` and deliver data frames to their callback.
    pub fn route(&self, text: &str) -> Routed {
        match classify(text) {
            Frame::Data { topic, payload } => match Topic::from_venue(&topic) {
                Ok(parsed) => {
                    if self.registry.dispatch(&parsed, &payload) {
                        self.dispatched.fetch_add(1, Ordering::Relaxed);
                        Routed::Dispatched(parsed)
                    } else {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        Routed::Dropped(topic)
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "unroutable topic on inbound frame");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Routed::Dropped(topic)
                }
            },
            Frame::Control(ack) => Routed::Control(ack),
            Frame::Pong => Routed::Pong,
            Frame::Unknown => {
                debug!(len = text.len(), "ignoring unrecognised frame");
                Routed::Ignored
            }
        }
    }

    /// (dispatched, dropped) frame counters.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.dispatched.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}
