//! Multi-agent task orchestration runtime.
//!
//! A hierarchical supervision tree of message-passing actors spawns
//! LLM-backed worker processes, assigns them tasks through a market-style
//! auction ([`dispatcher`]), executes dependency graphs of tasks with
//! progressive decomposition ([`graph`]), and enforces per-task and
//! per-graph resource budgets ([`worker`]).
//!
//! The actor tree, leaves first:
//!
//! - [`skill_registry`] — capability lookup
//! - [`blackboard`] — cross-agent pub/sub
//! - [`memory`] — per-worker episodic store and long-term knowledge store
//! - [`worker`] — runtime-owning agents, their task tables, and the
//!   supervisor that restarts them
//! - [`dispatcher`] — broadcast-bid-select task assignment
//! - [`graph`] — DAG lifecycle, decomposition, and synthesis
//! - [`viewport`] — bridge to an external observer
//!
//! [`actor`] and [`supervision`] provide the minimal actor runtime these
//! modules are built on.

pub mod actor;
pub mod api;
pub mod blackboard;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod graph;
pub mod memory;
pub mod skill_registry;
pub mod supervision;
pub mod task;
pub mod version;
pub mod viewport;
pub mod worker;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// The task-level kinds (`GraphInvalid` through `WorkerCrashed`) map 1:1 to
/// the error table in the runtime's error handling design; the rest are
/// ambient to running this as a real service. Retrieval timeouts and sidecar
/// failures deliberately do not appear here — those degrade gracefully at
/// the call site and are only ever logged.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A submitted graph failed acyclicity or referential-integrity validation.
    #[error("graph rejected: {0}")]
    GraphInvalid(String),

    /// No registered worker's capability set is a superset of the task's requirements.
    #[error("no agent satisfies the capability requirement: {0:?}")]
    NoCapableWorker(Vec<String>),

    /// A Critical-risk task's approval request was denied.
    #[error("risk approval denied for task {task_id}: {reason}")]
    RiskDenied { task_id: String, reason: String },

    /// A task's deadline timer fired before it reached a terminal state.
    #[error("task {0} exceeded its deadline")]
    TaskDeadlineExceeded(String),

    /// A task's estimated token usage crossed the cancellation threshold.
    #[error("task {task_id} exceeded its token budget: {estimated} > {max}")]
    TokenBudgetExceeded {
        task_id: String,
        estimated: u64,
        max: u64,
    },

    /// A proposed subplan violated a decomposition limit.
    #[error("decomposition rejected for {parent_id}: {reason}")]
    DecompositionInvalid { parent_id: String, reason: String },

    /// The external runtime process exited or otherwise crashed.
    #[error("runtime crashed for worker {0}")]
    RuntimeCrashed(String),

    /// An actor supervising a worker exceeded its restart budget.
    #[error("worker {0} crashed past its restart limit")]
    WorkerCrashed(String),

    /// A task or graph id referenced an entity that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic/internal error not otherwise classified.
    #[error("orchestrator error: {0}")]
    General(String),

    /// I/O error (subprocess spawn, file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP/WebSocket boundary rejected or could not service a request.
    #[error("http error: {0}")]
    Http(String),
}

/// Result type used throughout the orchestration core.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Execution risk tier attached to a task's budget.
///
/// `Critical` tasks are gated on external approval before dispatch (see
/// [`dispatcher::Dispatcher`]); the other tiers dispatch immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Normal
    }
}

/// Resource budget attached to a task or subtask.
///
/// The invariant that a subtask's declared budget caps sum to at most its
/// parent's remaining budget is enforced by [`graph`] at decomposition-accept
/// time, not by this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskBudget {
    /// Wall-clock deadline for the task, relative to assignment.
    #[serde(default, with = "duration_millis_opt")]
    pub deadline: Option<std::time::Duration>,
    /// Approximate max tokens (char÷4 heuristic), enforced by `worker::runtime`.
    pub max_tokens: Option<u64>,
    /// Risk tier; `Critical` gates dispatch on approval.
    #[serde(default)]
    pub risk: RiskLevel,
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Estimate a token count from raw output length using the crate-wide
/// char÷4 heuristic. Exact token counting is out of scope by design: this
/// approximation is intentionally model-agnostic.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64) / 4
}

/// Get version information.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Normal);
        assert!(RiskLevel::Normal < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_risk_level_default() {
        assert_eq!(RiskLevel::default(), RiskLevel::Normal);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(400), 100);
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(3), 0);
    }

    #[test]
    fn test_task_budget_default() {
        let budget = TaskBudget::default();
        assert!(budget.deadline.is_none());
        assert!(budget.max_tokens.is_none());
        assert_eq!(budget.risk, RiskLevel::Normal);
    }

    #[test]
    fn test_task_budget_roundtrip() {
        let budget = TaskBudget {
            deadline: Some(std::time::Duration::from_millis(1500)),
            max_tokens: Some(100),
            risk: RiskLevel::Critical,
        };
        let json = serde_json::to_string(&budget).unwrap();
        let back: TaskBudget = serde_json::from_str(&json).unwrap();
        assert_eq!(back.deadline, budget.deadline);
        assert_eq!(back.max_tokens, budget.max_tokens);
        assert_eq!(back.risk, budget.risk);
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
