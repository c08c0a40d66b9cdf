//! Market-style task auction and dispatch.
//!
//! The central auction engine: gate Critical-risk tasks on approval, ask
//! the skill registry who's capable, broadcast the task to them, collect
//! bids for a fixed window, and assign to a winner — falling back to the
//! first capable worker (by registry snapshot order) if nobody bid.
//!
//! Bid collection for different tasks never interferes: each task's
//! in-flight auction is tracked by its own entry in `collectors`, keyed by
//! task-id, and the window timer for one task is blind to any other.

use std::collections::HashMap;
use std::time::Duration;

use crate::actor::{self, ActorRef, Mailbox};
use crate::events::EventBus;
use crate::skill_registry::SkillRegistryHandle;
use crate::task::{Bid, OutcomeRef, TaskOutcome, TaskSpec};
use crate::worker::{WorkerHandle, WorkerMsg};
use crate::RiskLevel;

/// Messages accepted by the [`Dispatcher`] actor.
pub enum DispatcherMsg {
    /// A new or returning worker is available for auctions.
    RegisterWorker { worker_id: String, handle: WorkerHandle },
    /// A worker has stopped and must no longer receive broadcasts.
    UnregisterWorker { worker_id: String },
    /// Submit a task for dispatch.
    TaskRequest { spec: TaskSpec, reply_to: OutcomeRef },
    /// A worker's bid for an open auction.
    SubmitBid(Bid),
    /// Approval response for a pending Critical-risk task.
    RiskApproved { task_id: String },
    RiskDenied { task_id: String, reason: String },
    /// List tasks currently blocked on external approval.
    ListPendingApprovals {
        reply: tokio::sync::oneshot::Sender<Vec<PendingApprovalInfo>>,
    },
    /// Internal: a bid window's timer fired.
    BidWindowClosed { task_id: String },
}

/// A task blocked on external approval, as surfaced to callers outside the
/// dispatcher (the approvals-list HTTP route, tests).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingApprovalInfo {
    pub task_id: String,
    pub description: String,
    pub risk: RiskLevel,
}

/// Cloneable handle to a running [`Dispatcher`] actor.
#[derive(Clone)]
pub struct DispatcherHandle {
    actor: ActorRef<DispatcherMsg>,
}

impl DispatcherHandle {
    pub fn register_worker(&self, worker_id: impl Into<String>, handle: WorkerHandle) {
        let _ = self.actor.send(DispatcherMsg::RegisterWorker {
            worker_id: worker_id.into(),
            handle,
        });
    }

    pub fn unregister_worker(&self, worker_id: impl Into<String>) {
        let _ = self.actor.send(DispatcherMsg::UnregisterWorker {
            worker_id: worker_id.into(),
        });
    }

    pub fn submit_task(&self, spec: TaskSpec, reply_to: OutcomeRef) {
        let _ = self.actor.send(DispatcherMsg::TaskRequest { spec, reply_to });
    }

    pub fn submit_bid(&self, bid: Bid) {
        let _ = self.actor.send(DispatcherMsg::SubmitBid(bid));
    }

    pub fn approve_risk(&self, task_id: impl Into<String>) {
        let _ = self.actor.send(DispatcherMsg::RiskApproved {
            task_id: task_id.into(),
        });
    }

    pub fn deny_risk(&self, task_id: impl Into<String>, reason: impl Into<String>) {
        let _ = self.actor.send(DispatcherMsg::RiskDenied {
            task_id: task_id.into(),
            reason: reason.into(),
        });
    }

    pub async fn list_pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .actor
            .send(DispatcherMsg::ListPendingApprovals { reply })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn as_actor_ref(&self) -> ActorRef<DispatcherMsg> {
        self.actor.clone()
    }
}

struct PendingApproval {
    spec: TaskSpec,
    reply_to: OutcomeRef,
}

struct BidCollector {
    spec: TaskSpec,
    reply_to: OutcomeRef,
    capable_snapshot: Vec<String>,
    bids: Vec<Bid>,
}

pub struct Dispatcher {
    registry: SkillRegistryHandle,
    workers: HashMap<String, WorkerHandle>,
    bid_window: Duration,
    pending_approval: HashMap<String, PendingApproval>,
    collectors: HashMap<String, BidCollector>,
    event_bus: EventBus,
    self_ref: Option<ActorRef<DispatcherMsg>>,
}

impl Dispatcher {
    pub fn spawn(
        registry: SkillRegistryHandle,
        bid_window: Duration,
        event_bus: EventBus,
    ) -> DispatcherHandle {
        let (actor, mailbox) = actor::mailbox();
        let dispatcher = Self {
            registry,
            workers: HashMap::new(),
            bid_window,
            pending_approval: HashMap::new(),
            collectors: HashMap::new(),
            event_bus,
            self_ref: Some(actor.clone()),
        };
        actor::spawn_actor(move || dispatcher.run(mailbox));
        DispatcherHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<DispatcherMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                DispatcherMsg::RegisterWorker { worker_id, handle } => {
                    self.workers.insert(worker_id, handle);
                }
                DispatcherMsg::UnregisterWorker { worker_id } => {
                    self.workers.remove(&worker_id);
                }
                DispatcherMsg::TaskRequest { spec, reply_to } => {
                    self.handle_task_request(spec, reply_to).await;
                }
                DispatcherMsg::SubmitBid(bid) => self.handle_bid(bid),
                DispatcherMsg::RiskApproved { task_id } => {
                    self.handle_risk_approved(task_id).await;
                }
                DispatcherMsg::RiskDenied { task_id, reason } => {
                    self.handle_risk_denied(task_id, reason);
                }
                DispatcherMsg::ListPendingApprovals { reply } => {
                    let _ = reply.send(self.list_pending_approvals());
                }
                DispatcherMsg::BidWindowClosed { task_id } => {
                    self.close_bid_window(task_id);
                }
            }
        }
    }

    async fn handle_task_request(&mut self, spec: TaskSpec, reply_to: OutcomeRef) {
        let risk = spec.budget.as_ref().map(|b| b.risk).unwrap_or_default();
        if risk == RiskLevel::Critical {
            let task_id = spec.id.clone();
            let description = spec.description.clone();
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::risk_approval_required(
                    task_id.clone(),
                    risk,
                    description,
                ));
            self.pending_approval
                .insert(task_id, PendingApproval { spec, reply_to });
            return;
        }
        self.open_auction(spec, reply_to).await;
    }

    fn list_pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        self.pending_approval
            .values()
            .map(|pending| PendingApprovalInfo {
                task_id: pending.spec.id.clone(),
                description: pending.spec.description.clone(),
                risk: pending
                    .spec
                    .budget
                    .as_ref()
                    .map(|b| b.risk)
                    .unwrap_or_default(),
            })
            .collect()
    }

    async fn handle_risk_approved(&mut self, task_id: String) {
        if let Some(pending) = self.pending_approval.remove(&task_id) {
            self.open_auction(pending.spec, pending.reply_to).await;
        }
    }

    fn handle_risk_denied(&mut self, task_id: String, reason: String) {
        if let Some(pending) = self.pending_approval.remove(&task_id) {
            let _ = pending.reply_to.send(TaskOutcome::Failed {
                task_id: pending.spec.id,
                reason: format!("risk approval denied: {reason}"),
                graph_id: pending.spec.graph_id,
            });
        }
    }

    async fn open_auction(&mut self, spec: TaskSpec, reply_to: OutcomeRef) {
        let capable = self.registry.query_capable(spec.required_capabilities.clone()).await;
        if capable.is_empty() {
            let _ = reply_to.send(TaskOutcome::Failed {
                task_id: spec.id.clone(),
                reason: "no agent satisfies the capability requirement".to_string(),
                graph_id: spec.graph_id.clone(),
            });
            return;
        }

        for worker_id in &capable {
            if let Some(handle) = self.workers.get(worker_id) {
                handle.task_available(
                    spec.id.clone(),
                    spec.description.clone(),
                    spec.required_capabilities.clone(),
                    self.bid_window,
                );
            }
        }

        let task_id = spec.id.clone();
        self.collectors.insert(
            task_id.clone(),
            BidCollector {
                spec,
                reply_to,
                capable_snapshot: capable,
                bids: Vec::new(),
            },
        );

        if let Some(self_ref) = self.self_ref.clone() {
            let window = self.bid_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let _ = self_ref.send(DispatcherMsg::BidWindowClosed { task_id });
            });
        }
    }

    fn handle_bid(&mut self, bid: Bid) {
        if let Some(collector) = self.collectors.get_mut(&bid.task_id) {
            if collector.capable_snapshot.contains(&bid.worker_id) {
                collector.bids.push(bid);
            }
        }
    }

    fn close_bid_window(&mut self, task_id: String) {
        let Some(mut collector) = self.collectors.remove(&task_id) else {
            return;
        };

        let winner = collector
            .bids
            .iter()
            .max_by(|a, b| {
                a.fitness
                    .partial_cmp(&b.fitness)
                    .unwrap()
                    .then(b.active_count.cmp(&a.active_count))
                    .then(b.estimated_duration.cmp(&a.estimated_duration))
            })
            .map(|b| b.worker_id.clone());

        let winner = match winner {
            Some(id) => id,
            None => {
                tracing::warn!(task_id = %task_id, "no bids received, falling back to first capable worker");
                match collector.capable_snapshot.first() {
                    Some(id) => id.clone(),
                    None => return,
                }
            }
        };

        for bidder in std::mem::take(&mut collector.bids) {
            if bidder.worker_id != winner {
                if let Some(handle) = self.workers.get(&bidder.worker_id) {
                    handle.bid_rejected(task_id.clone());
                }
            }
        }

        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(
                collector.spec.graph_id.clone().unwrap_or_default(),
                &task_id,
                "assigned",
            ));

        if let Some(handle) = self.workers.get(&winner) {
            handle.task_assigned(collector.spec, collector.reply_to);
        } else {
            let _ = collector.reply_to.send(TaskOutcome::Failed {
                task_id: collector.spec.id,
                reason: "assigned worker is no longer registered".to_string(),
                graph_id: collector.spec.graph_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill_registry::SkillRegistry;
    use crate::worker::{Worker, WorkerConfig};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_no_capable_worker_fails_fast() {
        let registry = SkillRegistry::spawn();
        let dispatcher = Dispatcher::spawn(registry, Duration::from_millis(20), EventBus::new());
        let (reply, mut outcome_mailbox) = actor::mailbox();

        dispatcher.submit_task(TaskSpec::new("t1", "x").with_capabilities(caps(&["fly"])), reply);

        match outcome_mailbox.recv().await.unwrap() {
            TaskOutcome::Failed { reason, .. } => assert!(reason.contains("no agent")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_critical_risk_blocks_until_approved() {
        let registry = SkillRegistry::spawn();
        let event_bus = EventBus::new();
        let mut viewport_rx = event_bus.subscribe_viewport();
        let dispatcher = Dispatcher::spawn(registry.clone(), Duration::from_millis(20), event_bus);

        let sidecar = Arc::new(crate::memory::InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit"]),
            WorkerConfig::default(),
            dispatcher.clone(),
            registry,
            sidecar,
            EventBus::new(),
        );
        dispatcher.register_worker("w1", worker);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (reply, mut outcome_mailbox) = actor::mailbox();
        let spec = TaskSpec::new("t1", "x")
            .with_capabilities(caps(&["edit"]))
            .with_budget(crate::TaskBudget {
                risk: RiskLevel::Critical,
                ..Default::default()
            });
        dispatcher.submit_task(spec, reply);

        // nothing should arrive before approval
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outcome_mailbox.try_recv().is_err());

        match viewport_rx.recv().await.unwrap() {
            crate::events::ViewportEvent::RiskApprovalRequired { task_id, risk, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(risk, RiskLevel::Critical);
            }
            other => panic!("expected risk_approval_required event, got {other:?}"),
        }

        let pending = dispatcher.list_pending_approvals().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "t1");

        dispatcher.approve_risk("t1");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(dispatcher.list_pending_approvals().await.is_empty());
    }

    #[tokio::test]
    async fn test_risk_denied_fails_task() {
        let registry = SkillRegistry::spawn();
        let dispatcher = Dispatcher::spawn(registry, Duration::from_millis(20), EventBus::new());
        let (reply, mut outcome_mailbox) = actor::mailbox();

        let spec = TaskSpec::new("t1", "x")
            .with_capabilities(caps(&["edit"]))
            .with_budget(crate::TaskBudget {
                risk: RiskLevel::Critical,
                ..Default::default()
            });
        dispatcher.submit_task(spec, reply);
        dispatcher.deny_risk("t1", "not authorized");

        match outcome_mailbox.recv().await.unwrap() {
            TaskOutcome::Failed { reason, .. } => assert!(reason.contains("not authorized")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
