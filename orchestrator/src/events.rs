//! Process-wide event bus.
//!
//! Every actor that produces an externally observable fact — a worker
//! spawning, a runtime line of output, a graph completing — publishes it
//! here as a [`ViewportEvent`] rather than addressing the viewport
//! directly. [`viewport::Viewport`](crate::viewport::Viewport) is the one
//! subscriber that forwards these to an external sink, but nothing stops a
//! test or a future subscriber (metrics, audit log) from subscribing too.
//!
//! [`TaskBudgetReport`] travels the same bus; it is not viewport-facing but
//! sharing the transport keeps `WorkerTasks` from needing its own channel
//! wiring to every interested listener.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::RiskLevel;

/// Default capacity of the broadcast channel. Slow subscribers that fall
/// behind by more than this many events will observe a `Lagged` error on
/// their next `recv` and should treat it as "resynchronize from current
/// state," not as a fatal condition.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// All externally observable facts the core emits, beyond direct task
/// submission responses. Carries exactly the vocabulary named for the
/// viewport and the system event bus: spawn/despawn, state change, runtime
/// started/exited, runtime output, and graph submitted/status-changed/completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewportEvent {
    /// A worker was spawned and registered its capabilities.
    WorkerSpawned {
        worker_id: String,
        capabilities: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A worker was stopped, either on request or by its supervisor.
    WorkerDespawned {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker's heuristically classified activity state changed.
    WorkerStateChanged {
        worker_id: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker's runtime process started.
    RuntimeStarted {
        worker_id: String,
        runtime_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker's runtime process exited, cleanly or otherwise.
    RuntimeExited {
        worker_id: String,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    /// One line of raw output from a worker's runtime.
    RuntimeOutputLine {
        worker_id: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
    /// A graph was accepted or rejected.
    GraphSubmitted {
        graph_id: String,
        accepted: bool,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A node within a graph changed status.
    NodeStatusChanged {
        graph_id: String,
        task_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    /// A graph reached completion; every node is terminal.
    GraphCompleted {
        graph_id: String,
        results: std::collections::HashMap<String, bool>,
        timestamp: DateTime<Utc>,
    },
    /// A Critical-risk task is blocked pending external approval.
    RiskApprovalRequired {
        task_id: String,
        risk: RiskLevel,
        description: String,
        timestamp: DateTime<Utc>,
    },
}

impl ViewportEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ViewportEvent::WorkerSpawned { timestamp, .. }
            | ViewportEvent::WorkerDespawned { timestamp, .. }
            | ViewportEvent::WorkerStateChanged { timestamp, .. }
            | ViewportEvent::RuntimeStarted { timestamp, .. }
            | ViewportEvent::RuntimeExited { timestamp, .. }
            | ViewportEvent::RuntimeOutputLine { timestamp, .. }
            | ViewportEvent::GraphSubmitted { timestamp, .. }
            | ViewportEvent::NodeStatusChanged { timestamp, .. }
            | ViewportEvent::GraphCompleted { timestamp, .. }
            | ViewportEvent::RiskApprovalRequired { timestamp, .. } => *timestamp,
        }
    }

    pub fn worker_spawned(worker_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        ViewportEvent::WorkerSpawned {
            worker_id: worker_id.into(),
            capabilities,
            timestamp: Utc::now(),
        }
    }

    pub fn worker_despawned(worker_id: impl Into<String>) -> Self {
        ViewportEvent::WorkerDespawned {
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn worker_state_changed(worker_id: impl Into<String>, state: impl Into<String>) -> Self {
        ViewportEvent::WorkerStateChanged {
            worker_id: worker_id.into(),
            state: state.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn runtime_started(worker_id: impl Into<String>, runtime_id: impl Into<String>) -> Self {
        ViewportEvent::RuntimeStarted {
            worker_id: worker_id.into(),
            runtime_id: runtime_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn runtime_exited(worker_id: impl Into<String>, exit_code: Option<i32>) -> Self {
        ViewportEvent::RuntimeExited {
            worker_id: worker_id.into(),
            exit_code,
            timestamp: Utc::now(),
        }
    }

    pub fn runtime_output_line(worker_id: impl Into<String>, line: impl Into<String>) -> Self {
        ViewportEvent::RuntimeOutputLine {
            worker_id: worker_id.into(),
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn graph_submitted(graph_id: impl Into<String>, accepted: bool, reason: Option<String>) -> Self {
        ViewportEvent::GraphSubmitted {
            graph_id: graph_id.into(),
            accepted,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn node_status_changed(
        graph_id: impl Into<String>,
        task_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        ViewportEvent::NodeStatusChanged {
            graph_id: graph_id.into(),
            task_id: task_id.into(),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn graph_completed(
        graph_id: impl Into<String>,
        results: std::collections::HashMap<String, bool>,
    ) -> Self {
        ViewportEvent::GraphCompleted {
            graph_id: graph_id.into(),
            results,
            timestamp: Utc::now(),
        }
    }

    pub fn risk_approval_required(
        task_id: impl Into<String>,
        risk: RiskLevel,
        description: impl Into<String>,
    ) -> Self {
        ViewportEvent::RiskApprovalRequired {
            task_id: task_id.into(),
            risk,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Budget accounting emitted by `WorkerTasks` when a task reaches a
/// terminal state. Token usage is always reported, zero if unmeasured,
/// rather than the report being skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskBudgetReport {
    pub task_id: String,
    pub worker_id: String,
    pub elapsed_ms: u64,
    pub estimated_tokens: u64,
    pub risk: RiskLevel,
    pub deadline_exceeded: bool,
    pub token_budget_exceeded: bool,
}

/// Process-wide event bus. Cheap to clone; every clone shares the same
/// underlying broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    viewport_tx: broadcast::Sender<ViewportEvent>,
    budget_tx: broadcast::Sender<TaskBudgetReport>,
}

impl EventBus {
    pub fn new() -> Self {
        let (viewport_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (budget_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            viewport_tx,
            budget_tx,
        }
    }

    /// Publish a viewport event. Returns the number of current receivers;
    /// `Ok(0)` (no subscribers) is not an error — the viewport may not be
    /// running, and publication must never block on a subscriber.
    pub fn publish_viewport(&self, event: ViewportEvent) -> usize {
        tracing::debug!(event = ?event, "viewport event");
        self.viewport_tx.send(event).unwrap_or(0)
    }

    /// Publish a task budget report.
    pub fn publish_budget(&self, report: TaskBudgetReport) -> usize {
        tracing::debug!(report = ?report, "task budget report");
        self.budget_tx.send(report).unwrap_or(0)
    }

    pub fn subscribe_viewport(&self) -> broadcast::Receiver<ViewportEvent> {
        self.viewport_tx.subscribe()
    }

    pub fn subscribe_budget(&self) -> broadcast::Receiver<TaskBudgetReport> {
        self.budget_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_spawned_roundtrip() {
        let event = ViewportEvent::worker_spawned("w1", vec!["edit".to_string()]);
        let json = serde_json::to_string(&event).unwrap();
        let back: ViewportEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_viewport();
        let n = bus.publish_viewport(ViewportEvent::worker_despawned("w1"));
        assert_eq!(n, 1);
        let received = rx.recv().await.unwrap();
        match received {
            ViewportEvent::WorkerDespawned { worker_id, .. } => assert_eq!(worker_id, "w1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        assert_eq!(bus.publish_viewport(ViewportEvent::worker_despawned("w1")), 0);
    }

    #[tokio::test]
    async fn test_budget_report_bus_separate_from_viewport() {
        let bus = EventBus::new();
        let mut viewport_rx = bus.subscribe_viewport();
        let mut budget_rx = bus.subscribe_budget();

        bus.publish_budget(TaskBudgetReport {
            task_id: "t1".into(),
            worker_id: "w1".into(),
            elapsed_ms: 10,
            estimated_tokens: 0,
            risk: RiskLevel::Normal,
            deadline_exceeded: false,
            token_budget_exceeded: false,
        });

        assert!(budget_rx.recv().await.is_ok());
        assert!(viewport_rx.try_recv().is_err());
    }

    #[test]
    fn test_event_timestamp_accessor() {
        let event = ViewportEvent::worker_despawned("w1");
        assert!(event.timestamp() <= Utc::now());
    }
}
