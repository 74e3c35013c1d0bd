//! Typed publish/subscribe event bus (spec.md §9 "Event emission").
//!
//! Each event is a plain struct; subscribers register a `tokio::sync::mpsc`
//! sender and receive every event in temporal order. Delivery across
//! subscribers is independent — a slow subscriber never blocks another's
//! queue — but within one subscription events arrive in the order they were
//! emitted, matching spec.md §5's per-plan ordering guarantees.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{GroupId, NodeId, NodeStatus, PlanId};

#[derive(Debug, Clone)]
pub struct NodeTransitionEvent {
    pub plan_id: PlanId,
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlanCompletionEvent {
    pub plan_id: PlanId,
    pub status: crate::domain::PlanStatus,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PlanRegistered { plan_id: PlanId },
    PlanStarted { plan_id: PlanId },
    PlanCompleted(PlanCompletionEvent),
    PlanPaused { plan_id: PlanId },
    PlanResumed { plan_id: PlanId },
    PlanDeleted { plan_id: PlanId },
    NodeReady { plan_id: PlanId, node_id: NodeId },
    NodeStarted { plan_id: PlanId, node_id: NodeId },
    NodeCompleted { plan_id: PlanId, node_id: NodeId, success: bool },
    NodeRetry { plan_id: PlanId, node_id: NodeId },
    NodeTransition(NodeTransitionEvent),
    GroupTransition { plan_id: PlanId, group_id: GroupId, to: crate::domain::GroupStatus },
    NodeStepStatus {
        plan_id: PlanId,
        node_id: NodeId,
        phase: crate::domain::PhaseName,
        status: crate::domain::StepStatus,
    },
}

/// Fan-out publisher: holds every live subscriber and clones each event to
/// all of them. A subscriber whose receiver has been dropped is pruned on
/// the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Best-effort, per-subscription-ordered delivery. Subscribers are
    /// notified asynchronously relative to each other: a full or dropped
    /// channel never blocks this call or another subscriber's delivery.
    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn publish_delivers_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let plan_id = Uuid::new_v4();
        bus.publish(EngineEvent::PlanStarted { plan_id });
        bus.publish(EngineEvent::PlanDeleted { plan_id });

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                EngineEvent::PlanStarted { plan_id: p } => assert_eq!(p, plan_id),
                other => panic!("unexpected event: {other:?}"),
            }
            match rx.try_recv().unwrap() {
                EngineEvent::PlanDeleted { plan_id: p } => assert_eq!(p, plan_id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn dropped_subscriber_is_pruned_without_panicking() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        bus.publish(EngineEvent::PlanStarted {
            plan_id: Uuid::new_v4(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
