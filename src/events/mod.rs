pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::types::{Phase, WorkflowId, WorkflowMetrics, WorkflowStatus};

pub use bus::{EventBus, EventSubscriber};

/// Everything the core tells the outside world, tagged for wire encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStarted {
        title: String,
    },
    WorkflowStateUpdated {
        status: WorkflowStatus,
        phase: Phase,
    },
    WorkflowCompleted {
        metrics: WorkflowMetrics,
    },
    WorkflowFailed {
        kind: String,
        message: String,
        task_id: Option<String>,
    },
    PhaseStarted {
        phase: Phase,
        replan: bool,
    },
    TaskCreated {
        task_id: String,
        name: String,
        agent: String,
    },
    TaskStarted {
        task_id: String,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
        commit: Option<String>,
    },
    TaskFailed {
        task_id: String,
        error: String,
        retries: u32,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    Log {
        level: String,
        message: String,
    },
    MetricsUpdate {
        metrics: WorkflowMetrics,
    },
    AgentStream {
        task_id: Option<String>,
        agent: String,
        chunk: String,
    },
    /// Synthetic: a subscriber's normal buffer overflowed and `count` events
    /// were dropped before this one.
    DroppedEvents {
        count: u64,
    },
}

impl EventPayload {
    /// Priority events ride the never-dropped channel; the publisher may
    /// block on them.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            EventPayload::WorkflowCompleted { .. }
                | EventPayload::WorkflowFailed { .. }
                | EventPayload::WorkflowStateUpdated { .. }
        )
    }

}

/// An event plus its delivery metadata: owning workflow, a sequence number
/// monotonic within that workflow, and the wall-clock publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub workflow_id: WorkflowId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_classification() {
        assert!(EventPayload::WorkflowCompleted {
            metrics: WorkflowMetrics::default()
        }
        .is_priority());
        assert!(EventPayload::WorkflowFailed {
            kind: "AgentFailure".into(),
            message: "x".into(),
            task_id: None
        }
        .is_priority());
        assert!(EventPayload::WorkflowStateUpdated {
            status: WorkflowStatus::Running,
            phase: Phase::Plan
        }
        .is_priority());
        assert!(!EventPayload::TaskStarted {
            task_id: "t1".into(),
            attempt: 0
        }
        .is_priority());
        assert!(!EventPayload::DroppedEvents { count: 3 }.is_priority());
    }

    #[test]
    fn envelope_serializes_with_flattened_payload() {
        let env = EventEnvelope {
            workflow_id: WorkflowId::parse("wf-20260101000000-abc123").unwrap(),
            seq: 7,
            timestamp: Utc::now(),
            payload: EventPayload::TaskCompleted {
                task_id: "t1".into(),
                commit: Some("deadbeef".into()),
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "task_completed");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["task_id"], "t1");
    }
}
