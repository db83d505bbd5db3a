//! Event model — the tagged variants carried by the bus and the stream.
//!
//! Every event serializes as `{"type": "...", ...payload}` so stream
//! clients can dispatch on the `type` tag alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::model::{Card, Task};

/// Topic name helpers. Topics are plain strings keyed by scope.
pub mod topic {
    /// Events visible to everyone.
    pub const GLOBAL: &str = "global";

    pub fn board(board_id: &str) -> String {
        format!("board:{board_id}")
    }

    pub fn user(user_id: &str) -> String {
        format!("user:{user_id}")
    }
}

/// A lifecycle event published on the bus.
///
/// Not persisted; exists only in flight between a publisher and the
/// subscribers connected at that moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskCreated {
        task: Task,
    },
    TaskClaimed {
        task: Task,
    },
    TaskProgress {
        task_id: String,
        progress_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_steps: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    TaskCompleted {
        task: Task,
    },
    TaskFailed {
        task: Task,
    },
    TaskCancelled {
        task: Task,
    },
    /// Routing after a terminal transition was skipped; diagnostic only.
    TaskRoutingSkipped {
        task_id: String,
        card_id: String,
        reason: String,
    },
    WorkerOnline {
        worker_id: String,
        user_id: String,
    },
    WorkerStale {
        worker_id: String,
        user_id: String,
    },
    WorkerOffline {
        worker_id: String,
        user_id: String,
    },
    CardMoved {
        card_id: String,
        from_column: String,
        to_column: String,
        card: Card,
    },
    CardUpdated {
        card: Card,
    },
    /// Keepalive frame emitted by the stream endpoint on idle.
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// The wire tag for this event, as it appears in the serialized form.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task_created",
            Event::TaskClaimed { .. } => "task_claimed",
            Event::TaskProgress { .. } => "task_progress",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskCancelled { .. } => "task_cancelled",
            Event::TaskRoutingSkipped { .. } => "task_routing_skipped",
            Event::WorkerOnline { .. } => "worker_online",
            Event::WorkerStale { .. } => "worker_stale",
            Event::WorkerOffline { .. } => "worker_offline",
            Event::CardMoved { .. } => "card_moved",
            Event::CardUpdated { .. } => "card_updated",
            Event::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert_eq!(topic::board("b1"), "board:b1");
        assert_eq!(topic::user("alice"), "user:alice");
        assert_eq!(topic::GLOBAL, "global");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::WorkerOnline {
            worker_id: "w1".into(),
            user_id: "alice".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"worker_online\""));
        assert!(json.contains("\"worker_id\":\"w1\""));
        assert_eq!(event.tag(), "worker_online");
    }

    #[test]
    fn progress_omits_absent_fields() {
        let event = Event::TaskProgress {
            task_id: "t1".into(),
            progress_text: "working".into(),
            step: None,
            total_steps: None,
            phase: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("step"));
        assert!(!json.contains("phase"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        match parsed {
            Event::TaskProgress { progress_text, .. } => {
                assert_eq!(progress_text, "working");
            }
            other => panic!("expected TaskProgress, got {}", other.tag()),
        }
    }
}
