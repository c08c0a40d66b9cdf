//! Per-worker active-task table: deadline timers and budget reporting.
//!
//! Owns no reply addresses and makes no dispatch decisions — it only
//! tracks start times and budgets for the worker's assigned tasks, arms a
//! single-shot deadline timer per task when one is present, and emits a
//! [`TaskBudgetReport`] on every terminal transition. The owning
//! [`Worker`](super::worker::Worker) is responsible for actually failing a
//! task and cancelling its runtime when this table reports a deadline
//! exceeded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::actor::{self, ActorRef, Mailbox};
use crate::events::{EventBus, TaskBudgetReport};
use crate::{RiskLevel, TaskBudget};

use super::worker::WorkerMsg;

/// Messages accepted by the [`WorkerTasks`] actor.
pub enum WorkerTasksMsg {
    TaskAssigned {
        task_id: String,
        budget: Option<TaskBudget>,
    },
    TaskFinished {
        task_id: String,
        estimated_tokens: u64,
        token_budget_exceeded: bool,
    },
    /// Internal: a task's deadline timer fired.
    DeadlineFired { task_id: String },
}

/// Cloneable handle to a running [`WorkerTasks`] actor.
#[derive(Clone)]
pub struct WorkerTasksHandle {
    actor: ActorRef<WorkerTasksMsg>,
}

impl WorkerTasksHandle {
    pub fn task_assigned(&self, task_id: impl Into<String>, budget: Option<TaskBudget>) {
        let _ = self.actor.send(WorkerTasksMsg::TaskAssigned {
            task_id: task_id.into(),
            budget,
        });
    }

    pub fn task_finished(
        &self,
        task_id: impl Into<String>,
        estimated_tokens: u64,
        token_budget_exceeded: bool,
    ) {
        let _ = self.actor.send(WorkerTasksMsg::TaskFinished {
            task_id: task_id.into(),
            estimated_tokens,
            token_budget_exceeded,
        });
    }
}

struct TrackedTask {
    worker_id: String,
    started_at: Instant,
    budget: Option<TaskBudget>,
}

pub struct WorkerTasks {
    worker_id: String,
    parent: ActorRef<WorkerMsg>,
    event_bus: EventBus,
    active: HashMap<String, TrackedTask>,
}

impl WorkerTasks {
    pub fn spawn(
        worker_id: impl Into<String>,
        parent: ActorRef<WorkerMsg>,
        event_bus: EventBus,
    ) -> WorkerTasksHandle {
        let (actor, mailbox) = actor::mailbox();
        let tasks = Self {
            worker_id: worker_id.into(),
            parent,
            event_bus,
            active: HashMap::new(),
        };
        actor::spawn_actor(move || tasks.run(mailbox, actor.clone()));
        WorkerTasksHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<WorkerTasksMsg>, self_ref: ActorRef<WorkerTasksMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                WorkerTasksMsg::TaskAssigned { task_id, budget } => {
                    self.handle_assigned(task_id, budget, &self_ref);
                }
                WorkerTasksMsg::TaskFinished {
                    task_id,
                    estimated_tokens,
                    token_budget_exceeded,
                } => {
                    self.handle_finished(task_id, estimated_tokens, token_budget_exceeded, false);
                }
                WorkerTasksMsg::DeadlineFired { task_id } => {
                    if self.active.contains_key(&task_id) {
                        let _ = self.parent.send(WorkerMsg::TaskDeadlineExceeded {
                            task_id: task_id.clone(),
                        });
                        self.handle_finished(task_id, 0, false, true);
                    }
                }
            }
        }
    }

    fn handle_assigned(&mut self, task_id: String, budget: Option<TaskBudget>, self_ref: &ActorRef<WorkerTasksMsg>) {
        if let Some(deadline) = budget.as_ref().and_then(|b| b.deadline) {
            let timer_ref = self_ref.clone();
            let timer_task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = timer_ref.send(WorkerTasksMsg::DeadlineFired {
                    task_id: timer_task_id,
                });
            });
        }
        self.active.insert(
            task_id,
            TrackedTask {
                worker_id: self.worker_id.clone(),
                started_at: Instant::now(),
                budget,
            },
        );
    }

    fn handle_finished(
        &mut self,
        task_id: String,
        estimated_tokens: u64,
        token_budget_exceeded: bool,
        deadline_exceeded: bool,
    ) {
        let Some(tracked) = self.active.remove(&task_id) else {
            return;
        };
        let elapsed_ms = tracked.started_at.elapsed().as_millis() as u64;
        let risk = tracked.budget.as_ref().map(|b| b.risk).unwrap_or(RiskLevel::Normal);

        self.event_bus.publish_budget(TaskBudgetReport {
            task_id,
            worker_id: tracked.worker_id,
            elapsed_ms,
            estimated_tokens,
            risk,
            deadline_exceeded,
            token_budget_exceeded,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_then_finish_emits_budget_report() {
        let event_bus = EventBus::new();
        let mut budget_rx = event_bus.subscribe_budget();
        let (parent, _mailbox) = actor::mailbox::<WorkerMsg>();
        let handle = WorkerTasks::spawn("w1", parent, event_bus);

        handle.task_assigned("t1", None);
        handle.task_finished("t1", 42, false);

        let report = budget_rx.recv().await.unwrap();
        assert_eq!(report.task_id, "t1");
        assert_eq!(report.estimated_tokens, 42);
        assert!(!report.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_deadline_timer_fires_and_notifies_parent() {
        let event_bus = EventBus::new();
        let mut budget_rx = event_bus.subscribe_budget();
        let (parent, mut parent_mailbox) = actor::mailbox::<WorkerMsg>();
        let handle = WorkerTasks::spawn("w1", parent, event_bus);

        handle.task_assigned(
            "t1",
            Some(TaskBudget {
                deadline: Some(Duration::from_millis(20)),
                ..Default::default()
            }),
        );

        let msg = tokio::time::timeout(Duration::from_secs(1), parent_mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            WorkerMsg::TaskDeadlineExceeded { task_id } => assert_eq!(task_id, "t1"),
            _ => panic!("expected TaskDeadlineExceeded"),
        }

        let report = budget_rx.recv().await.unwrap();
        assert!(report.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_finish_unknown_task_is_noop() {
        let event_bus = EventBus::new();
        let (parent, _mailbox) = actor::mailbox::<WorkerMsg>();
        let handle = WorkerTasks::spawn("w1", parent, event_bus);
        handle.task_finished("ghost", 0, false);
    }
}
