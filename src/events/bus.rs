//! Topic-based pub/sub over per-topic broadcast channels.
//!
//! Each subscriber owns a bounded cursor (capacity 100) into its topic's
//! ring. A slow subscriber lags and loses its oldest events; publishers
//! never block and never observe subscriber health. FIFO per
//! (topic, subscriber); no ordering across topics.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::trace;

use super::model::Event;

/// Per-subscriber queue depth before oldest events are dropped.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// In-process event bus. Cheap to share behind an `Arc`.
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a topic. Non-blocking; events published to a
    /// topic with no live subscribers are discarded.
    pub fn publish(&self, topic: &str, event: Event) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                // Last receiver went away; prune the topic entry.
                topics.remove(topic);
                return;
            }
            trace!(topic, tag = event.tag(), "publish");
            // send() only errors when there are no receivers, checked above.
            let _ = sender.send(event);
        }
    }

    /// Publish to the `board:<id>` topic.
    pub fn publish_to_board(&self, board_id: &str, event: Event) {
        self.publish(&super::model::topic::board(board_id), event);
    }

    /// Publish to the `user:<id>` topic.
    pub fn publish_to_user(&self, user_id: &str, event: Event) {
        self.publish(&super::model::topic::user(user_id), event);
    }

    /// Number of live topics (subscribed at least once and not pruned).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
