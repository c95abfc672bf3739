// =============================================================================
// Subscription Registry — Topics, callbacks and live flags
// =============================================================================
//
// Pure state: no I/O happens here.  Entries keep insertion order so that a
// reconnect replays subscriptions in the order the caller made them.
//
// A subscription survives reconnects; only its `active` flag is recomputed
// when the connection replays the snapshot.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TopicParseError;
use crate::stream::topic::Topic;

/// Handler invoked for every data frame on a topic.
///
/// Runs on the transport's delivery task: it must not block.
pub type Callback = Arc<dyn Fn(&Topic, &Value) + Send + Sync>;

/// One registered topic.
#[derive(Clone)]
pub struct Subscription {
    pub topic: Topic,
    pub callback: Callback,
    /// Confirmed by the venue on the current session.
    pub active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic.to_string())
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `raw` and register `callback` under its canonical key.
    ///
    /// Re-adding an existing topic replaces its callback in place.
    pub fn add(&self, raw: &str, callback: Callback) -> Result<Topic, TopicParseError> {
        let topic: Topic = raw.parse()?;
        self.add_topic(topic.clone(), callback);
        Ok(topic)
    }

    pub fn add_topic(&self, topic: Topic, callback: Callback) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|s| s.topic == topic) {
            Some(existing) => {
                debug!(topic = %topic, "replacing callback for existing subscription");
                existing.callback = callback;
            }
            None => {
                debug!(topic = %topic, "subscription registered");
                entries.push(Subscription {
                    topic,
                    callback,
                    active: false,
                });
            }
        }
    }

    /// Remove `topic`.  Removing an absent topic is a no-op.
    ///
    /// Returns whether an entry was actually removed.
    pub fn remove(&self, topic: &Topic) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|s| &s.topic != topic);
        before != entries.len()
    }

    /// Every registered topic, in registration order.  This is the set a
    /// reconnect replays.
    pub fn snapshot(&self) -> Vec<Topic> {
        self.entries.read().iter().map(|s| s.topic.clone()).collect()
    }

    /// Topics confirmed on the current session.
    pub fn live_topics(&self) -> Vec<Topic> {
        self.entries
            .read()
            .iter()
            .filter(|s| s.active)
            .map(|s| s.topic.clone())
            .collect()
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.entries.read().iter().any(|s| &s.topic == topic)
    }

    pub fn is_active(&self, topic: &Topic) -> bool {
        self.entries
            .read()
            .iter()
            .any(|s| &s.topic == topic && s.active)
    }

    pub fn set_active(&self, topic: &Topic, active: bool) {
        if let Some(entry) = self.entries.write().iter_mut().find(|s| &s.topic == topic) {
            entry.active = active;
        }
    }

    /// Called when a session ends: nothing is live until replayed.
    pub fn mark_all_inactive(&self) {
        for entry in self.entries.write().iter_mut() {
            entry.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke the callback registered for `topic`.
    ///
    /// The callback is cloned out of the lock before it runs so that it may
    /// itself touch the registry.  Returns `false` when nothing is registered.
    pub fn dispatch(&self, topic: &Topic, payload: &Value) -> bool {
        let callback = {
            let entries = self.entries.read();
            entries
                .iter()
                .find(|s| &s.topic == topic)
                .map(|s| s.callback.clone())
        };

        match callback {
            Some(cb) => {
                cb(topic, payload);
                true
            }
            None => {
                warn!(topic = %topic, "no callback registered for topic, frame dropped");
                false
            }
        }
    }
}
