// =============================================================================
// Connection Events — Plain records for external loggers
// =============================================================================
//
// The connection and its monitor publish what happened on a broadcast
// channel.  Persisting them (CSV, database, dashboard) is the subscriber's
// business; nothing here depends on who listens.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::ConnectionState;

/// Capacity of the event channel; slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEventKind {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ReconnectFailed {
        attempt: u32,
        critical: bool,
        authentication: bool,
        error: String,
    },
    Resubscribed {
        restored: Vec<String>,
        failed: Vec<String>,
    },
    HeartbeatFailed {
        error: String,
    },
}

/// Timestamped event envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub id: String,
    pub endpoint: String,
    #[serde(flatten)]
    pub kind: ConnectionEventKind,
    /// ISO 8601 creation time.
    pub created_at: String,
}

impl ConnectionEvent {
    pub fn new(endpoint: impl Into<String>, kind: ConnectionEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            kind,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Publisher side of the event channel.
#[derive(Clone)]
pub struct EventBus {
    endpoint: String,
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            endpoint: endpoint.into(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is not an error.
    pub fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.tx.send(ConnectionEvent::new(self.endpoint.clone(), kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_flat_with_tag() {
        let ev = ConnectionEvent::new(
            "wss://example",
            ConnectionEventKind::ReconnectFailed {
                attempt: 5,
                critical: true,
                authentication: false,
                error: "reset".into(),
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "reconnect_failed");
        assert_eq!(v["attempt"], 5);
        assert_eq!(v["critical"], true);
        assert_eq!(v["endpoint"], "wss://example");
        assert!(v["created_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn emit_reaches_subscribers_and_tolerates_none() {
        let bus = EventBus::new("e");
        bus.emit(ConnectionEventKind::HeartbeatFailed { error: "x".into() });

        let mut rx = bus.subscribe();
        bus.emit(ConnectionEventKind::StateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Connected,
        });
        let ev = rx.recv().await.unwrap();
        assert!(matches!(
            ev.kind,
            ConnectionEventKind::StateChanged {
                to: ConnectionState::Connected,
                ..
            }
        ));
    }
}
