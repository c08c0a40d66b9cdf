//! Shared task-lifecycle value types.
//!
//! `TaskSpec`, `Bid`, and `TaskOutcome` cross actor boundaries — `Dispatcher`
//! sends `TaskSpec`s to `Worker`s, `Worker`s send `Bid`s and `TaskOutcome`s
//! back — so they live in their own module rather than under any one
//! actor's file, the way the data model is presented independently of the
//! components that operate on it.
//!
//! Every completion carries a `reply_to`: a first-class reference to
//! whichever mailbox dispatched the task, so `Worker` and `Dispatcher` never
//! need to know whether a task originated from a `TaskGraph` node or a bare
//! external `TaskRequest`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::actor::ActorRef;
use crate::TaskBudget;

/// A task ready to be auctioned or assigned. Carries its owning graph-id, if
/// any, so completions can be routed back in O(1).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    pub required_capabilities: HashSet<String>,
    pub budget: Option<TaskBudget>,
    pub graph_id: Option<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required_capabilities: HashSet::new(),
            budget: None,
            graph_id: None,
        }
    }

    pub fn with_capabilities(mut self, caps: HashSet<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    pub fn with_budget(mut self, budget: TaskBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_graph_id(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }
}

/// A worker's offer to take a task.
#[derive(Debug, Clone)]
pub struct Bid {
    pub task_id: String,
    pub worker_id: String,
    pub fitness: f64,
    pub active_count: usize,
    pub estimated_duration: std::time::Duration,
}

/// Rule for when a parent task's decomposed children are "done enough" to
/// synthesize a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    AllSubtasksComplete,
    FirstSuccess,
    UserDecision,
}

impl Default for StopCondition {
    fn default() -> Self {
        StopCondition::AllSubtasksComplete
    }
}

/// One child task proposed by a worker's decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub description: String,
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    #[serde(default)]
    pub budget: Option<TaskBudget>,
}

/// A worker-proposed decomposition of a task into dependent subtasks.
/// `dependencies` are edges expressed as indices into `subtasks`: `(from,
/// to)` meaning `subtasks[from]` must complete before `subtasks[to]` is
/// dispatchable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subplan {
    #[serde(default)]
    pub stop_condition: StopCondition,
    pub subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    pub dependencies: Vec<(usize, usize)>,
}

/// Sent by a worker back to a task's `reply_to` address on completion.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed {
        task_id: String,
        summary: Option<String>,
        subplan: Option<Subplan>,
        graph_id: Option<String>,
        /// Reverse channel into the reporting worker's own mailbox, present
        /// only alongside a proposed `subplan` — `TaskGraph` uses it to
        /// reply with the decomposition's accept/reject verdict and, later,
        /// the synthesis notice once every child has terminated.
        notice_ref: Option<ActorRef<GraphToWorkerMsg>>,
    },
    Failed {
        task_id: String,
        reason: String,
        graph_id: Option<String>,
    },
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Completed { task_id, .. } | TaskOutcome::Failed { task_id, .. } => task_id,
        }
    }

    pub fn graph_id(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { graph_id, .. } | TaskOutcome::Failed { graph_id, .. } => {
                graph_id.as_deref()
            }
        }
    }
}

/// Convenience alias: a reply address a completion is delivered to.
pub type OutcomeRef = ActorRef<TaskOutcome>;

/// Sent by a `TaskGraph` back to the worker whose `Subplan` proposal it is
/// acting on, or whose subtasks it has finished waiting for. A worker
/// forwards these into its own mailbox via
/// [`graph_notice_ref`](crate::worker::worker::graph_notice_ref) so a single
/// reply address can be handed to `TaskGraph` regardless of which notice it
/// eventually sends.
#[derive(Debug, Clone)]
pub enum GraphToWorkerMsg {
    /// The proposed decomposition was accepted and materialized into `
    /// child_ids` new graph nodes; the parent node now waits for them.
    DecompositionAccepted {
        parent_id: String,
        child_ids: Vec<String>,
    },
    /// The proposed decomposition was rejected (acyclicity, depth, or size
    /// limit violation); the parent node is failed.
    DecompositionRejected { parent_id: String, reason: String },
    /// Every child the parent's stop condition requires has finished;
    /// `results` is the list of (child task id, outcome) to synthesize from.
    SubtasksCompleted {
        parent_id: String,
        results: Vec<(String, TaskOutcome)>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_spec_builder() {
        let spec = TaskSpec::new("t1", "refactor")
            .with_capabilities(["edit".to_string()].into_iter().collect())
            .with_graph_id("g1");
        assert_eq!(spec.id, "t1");
        assert_eq!(spec.graph_id.as_deref(), Some("g1"));
        assert!(spec.required_capabilities.contains("edit"));
    }

    #[test]
    fn test_stop_condition_default() {
        assert_eq!(StopCondition::default(), StopCondition::AllSubtasksComplete);
    }

    #[test]
    fn test_task_outcome_accessors() {
        let outcome = TaskOutcome::Failed {
            task_id: "t1".into(),
            reason: "boom".into(),
            graph_id: Some("g1".into()),
        };
        assert_eq!(outcome.task_id(), "t1");
        assert_eq!(outcome.graph_id(), Some("g1"));
    }
}
