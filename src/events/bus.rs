use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use super::{EventEnvelope, EventPayload};
use crate::workflow::types::WorkflowId;

pub const DEFAULT_NORMAL_CAPACITY: usize = 100;
const PRIORITY_CAPACITY: usize = 64;

/// Fan-out channel between the runner/executor and presentation surfaces.
///
/// Routine events travel a bounded broadcast ring per subscriber: when a
/// subscriber falls behind, the oldest unread events are discarded and the
/// gap surfaces as a synthetic `DroppedEvents`. Workflow state transitions
/// travel a separate per-subscriber channel the publisher awaits on, so they
/// are never lost.
pub struct EventBus {
    normal: broadcast::Sender<EventEnvelope>,
    priority: Mutex<HashMap<u64, mpsc::Sender<EventEnvelope>>>,
    next_subscriber: AtomicU64,
    sequences: Mutex<HashMap<WorkflowId, u64>>,
}

impl EventBus {
    pub fn new(normal_capacity: usize) -> Arc<Self> {
        let (normal, _) = broadcast::channel(normal_capacity.max(1));
        Arc::new(EventBus {
            normal,
            priority: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_NORMAL_CAPACITY)
    }

    /// Publish one event on behalf of `workflow_id`. Assigns the workflow's
    /// next sequence number. Never blocks for routine events; may await slow
    /// subscribers for priority events.
    pub async fn publish(&self, workflow_id: &WorkflowId, payload: EventPayload) {
        let seq = {
            let mut seqs = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
            let counter = seqs.entry(workflow_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let envelope = EventEnvelope {
            workflow_id: workflow_id.clone(),
            seq,
            timestamp: Utc::now(),
            payload,
        };
        trace!(workflow_id = %workflow_id, seq, "publishing event");

        if envelope.payload.is_priority() {
            let targets: Vec<(u64, mpsc::Sender<EventEnvelope>)> = {
                let subs = self.priority.lock().unwrap_or_else(|e| e.into_inner());
                subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
            };
            for (id, tx) in targets {
                if tx.send(envelope.clone()).await.is_err() {
                    // Receiver went away without unsubscribing; forget it.
                    self.priority
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                }
            }
        } else {
            // A send error just means nobody is listening right now.
            let _ = self.normal.send(envelope);
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> EventSubscriber {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PRIORITY_CAPACITY);
        self.priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        EventSubscriber {
            id,
            bus: Arc::clone(self),
            normal: self.normal.subscribe(),
            priority: rx,
            pending_normal: None,
            pending_priority: None,
            normal_closed: false,
            priority_closed: false,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// One subscriber's view of the bus. Buffers one envelope per channel and
/// hands them out by sequence number, so a workflow's events arrive in
/// publish order no matter which channel carried them; `None` means the bus
/// has shut down.
pub struct EventSubscriber {
    id: u64,
    bus: Arc<EventBus>,
    normal: broadcast::Receiver<EventEnvelope>,
    priority: mpsc::Receiver<EventEnvelope>,
    pending_normal: Option<EventEnvelope>,
    pending_priority: Option<EventEnvelope>,
    normal_closed: bool,
    priority_closed: bool,
}

impl EventSubscriber {
    /// Next event in publish order.
    ///
    /// `publish` returns only after an event is enqueued on both fan-out
    /// paths, so anything published earlier is already visible to
    /// `try_recv` here; holding one candidate from each channel and
    /// releasing the lower sequence number therefore reproduces publish
    /// order for every workflow, lag markers aside.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            self.fill_pending();
            match (self.pending_normal.as_ref(), self.pending_priority.as_ref()) {
                (Some(normal), Some(prio)) => {
                    let normal_first = if normal.workflow_id == prio.workflow_id {
                        normal.seq <= prio.seq
                    } else {
                        // No cross-workflow ordering is promised; drain the
                        // routine side so it cannot back up.
                        true
                    };
                    return if normal_first {
                        self.pending_normal.take()
                    } else {
                        self.pending_priority.take()
                    };
                }
                (Some(_), None) => return self.pending_normal.take(),
                (None, Some(_)) => return self.pending_priority.take(),
                (None, None) if self.normal_closed && self.priority_closed => return None,
                (None, None) => {}
            }

            // Nothing buffered yet: park until either channel produces.
            tokio::select! {
                normal = self.normal.recv(), if !self.normal_closed => match normal {
                    Ok(env) => self.pending_normal = Some(env),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        self.pending_normal = Some(Self::dropped(count));
                    }
                    Err(broadcast::error::RecvError::Closed) => self.normal_closed = true,
                },
                prio = self.priority.recv(), if !self.priority_closed => match prio {
                    Some(env) => self.pending_priority = Some(env),
                    None => self.priority_closed = true,
                },
            }
        }
    }

    /// Top up both pending slots without blocking.
    fn fill_pending(&mut self) {
        if self.pending_normal.is_none() && !self.normal_closed {
            match self.normal.try_recv() {
                Ok(env) => self.pending_normal = Some(env),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    self.pending_normal = Some(Self::dropped(count));
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
                Err(broadcast::error::TryRecvError::Closed) => self.normal_closed = true,
            }
        }
        if self.pending_priority.is_none() && !self.priority_closed {
            match self.priority.try_recv() {
                Ok(env) => self.pending_priority = Some(env),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.priority_closed = true,
            }
        }
    }

    fn dropped(count: u64) -> EventEnvelope {
        EventEnvelope {
            workflow_id: WorkflowId::bus_synthetic(),
            seq: 0,
            timestamp: Utc::now(),
            payload: EventPayload::DroppedEvents { count },
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Phase, WorkflowMetrics, WorkflowStatus};

    fn wf_id() -> WorkflowId {
        WorkflowId::parse("wf-20260101000000-abc123").unwrap()
    }

    fn log(msg: &str) -> EventPayload {
        EventPayload::Log {
            level: "info".into(),
            message: msg.into(),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus.subscribe();
        let id = wf_id();

        bus.publish(&id, log("one")).await;
        bus.publish(&id, log("two")).await;
        bus.publish(&id, log("three")).await;

        for (i, expected) in ["one", "two", "three"].iter().enumerate() {
            let env = sub.recv().await.unwrap();
            assert_eq!(env.seq, (i + 1) as u64);
            match env.payload {
                EventPayload::Log { message, .. } => assert_eq!(&message, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn merges_channels_in_publish_order() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus.subscribe();
        let id = wf_id();

        // Interleave routine and priority publishes, then consume late so
        // both channels hold a backlog when the subscriber first polls.
        bus.publish(&id, log("one")).await;
        bus.publish(&id, log("two")).await;
        bus.publish(
            &id,
            EventPayload::WorkflowStateUpdated {
                status: WorkflowStatus::Running,
                phase: Phase::Execute,
            },
        )
        .await;
        bus.publish(&id, log("three")).await;
        bus.publish(
            &id,
            EventPayload::WorkflowCompleted {
                metrics: WorkflowMetrics::default(),
            },
        )
        .await;

        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(sub.recv().await.unwrap().seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn priority_event_never_overtakes_earlier_routine_events() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus.subscribe();
        let id = wf_id();

        bus.publish(&id, log("before")).await;
        bus.publish(
            &id,
            EventPayload::WorkflowCompleted {
                metrics: WorkflowMetrics::default(),
            },
        )
        .await;

        let first = sub.recv().await.unwrap();
        assert!(matches!(first.payload, EventPayload::Log { .. }));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second.payload, EventPayload::WorkflowCompleted { .. }));
    }

    #[tokio::test]
    async fn saturated_subscriber_gets_dropped_events_marker() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        let id = wf_id();

        for i in 0..10 {
            bus.publish(&id, log(&format!("e{i}"))).await;
        }

        let first = sub.recv().await.unwrap();
        match first.payload {
            EventPayload::DroppedEvents { count } => assert!(count >= 6),
            other => panic!("expected drop marker, got {other:?}"),
        }
        // The surviving tail is still delivered in order.
        let next = sub.recv().await.unwrap();
        assert!(matches!(next.payload, EventPayload::Log { .. }));
    }

    #[tokio::test]
    async fn priority_events_survive_saturation() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        let id = wf_id();

        for i in 0..20 {
            bus.publish(&id, log(&format!("noise{i}"))).await;
        }
        bus.publish(
            &id,
            EventPayload::WorkflowCompleted {
                metrics: WorkflowMetrics::default(),
            },
        )
        .await;

        // Most of the noise was dropped; the completion must still arrive,
        // after whatever survived the ring.
        let mut saw_drop = false;
        loop {
            let env = sub.recv().await.unwrap();
            match env.payload {
                EventPayload::DroppedEvents { count } => {
                    assert!(count >= 18);
                    saw_drop = true;
                }
                EventPayload::WorkflowCompleted { .. } => break,
                EventPayload::Log { .. } => {}
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert!(saw_drop);
    }

    #[tokio::test]
    async fn sequences_are_per_workflow() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus.subscribe();
        let a = wf_id();
        let b = WorkflowId::parse("wf-20260101000000-def456").unwrap();

        bus.publish(&a, log("a1")).await;
        bus.publish(&b, log("b1")).await;
        bus.publish(&a, log("a2")).await;

        let seqs: Vec<(WorkflowId, u64)> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| (e.workflow_id, e.seq))
        .collect();

        assert_eq!(seqs[0], (a.clone(), 1));
        assert_eq!(seqs[1], (b, 1));
        assert_eq!(seqs[2], (a, 2));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_via_drop() {
        let bus = EventBus::with_default_capacity();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing with nobody listening is fine.
        bus.publish(
            &wf_id(),
            EventPayload::WorkflowStateUpdated {
                status: WorkflowStatus::Running,
                phase: Phase::Refine,
            },
        )
        .await;
    }
}
