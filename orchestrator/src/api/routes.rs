//! HTTP route definitions and handlers for the orchestration runtime.
//!
//! Each handler does the minimum needed to translate an HTTP request into a
//! message on the right actor's mailbox (or a direct `await` on its handle)
//! and the actor's reply back into JSON. None of the orchestration logic
//! lives here — it lives in [`crate::dispatcher`], [`crate::graph`], and
//! [`crate::worker::supervisor`].

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::actor;
use crate::api::error::{ApiError, ApiResult};
use crate::api::response::{self, SuccessResponse};
use crate::blackboard::BlackboardHandle;
use crate::config::AppConfig;
use crate::dispatcher::DispatcherHandle;
use crate::graph::{GraphHandle, GraphNodeSpec, GraphSnapshot, GraphSubmitOutcome, SubmitGraphRequest};
use crate::task::{OutcomeRef, TaskOutcome, TaskSpec};
use crate::viewport::ViewportHandle;
use crate::worker::supervisor::WorkerSupervisorHandle;
use crate::worker::types::RuntimeKind;
use crate::TaskBudget;

/// Everything a handler needs: actor handles plus the loaded config (for
/// deriving per-worker `WorkerConfig` from the request's runtime choice).
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
    pub supervisor: WorkerSupervisorHandle,
    pub graph: GraphHandle,
    pub viewport: ViewportHandle,
    pub blackboard: BlackboardHandle,
    pub config: AppConfig,
    /// Fire-and-forget reply address for bare (non-graph) task submissions.
    /// There is no endpoint to poll a bare task's outcome — completions are
    /// only observable via logs.
    pub task_outcomes: OutcomeRef,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/workers", post(spawn_worker))
        .route("/api/v1/workers/:id", delete(stop_worker))
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/graphs", post(submit_graph))
        .route("/api/v1/graphs/:id", get(graph_status))
        .route("/api/v1/approvals", get(list_approvals))
        .route("/api/v1/approvals/:task_id", post(approve_or_deny))
        .route("/api/v1/blackboard", get(blackboard_list).post(blackboard_publish))
        .route("/api/v1/blackboard/:key", get(blackboard_query))
        .route("/ws/viewport", get(super::ws::viewport_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn a mailbox that logs every outcome it receives and never replies
/// anywhere else — the reply address handed to bare `POST /api/v1/tasks`
/// submissions.
pub fn task_outcome_logger() -> OutcomeRef {
    let (actor, mut mailbox) = actor::mailbox::<TaskOutcome>();
    tokio::spawn(async move {
        while let Some(outcome) = mailbox.recv().await {
            match outcome {
                TaskOutcome::Completed { task_id, summary, .. } => {
                    tracing::info!(task_id = %task_id, summary = ?summary, "task completed");
                }
                TaskOutcome::Failed { task_id, reason, .. } => {
                    tracing::warn!(task_id = %task_id, reason = %reason, "task failed");
                }
            }
        }
    });
    actor
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::version(),
    })
}

#[derive(Debug, Deserialize)]
struct SpawnWorkerRequest {
    worker_id: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    runtime: Option<RuntimeKind>,
}

#[derive(Debug, Serialize)]
struct SpawnWorkerResponse {
    worker_id: String,
}

async fn spawn_worker(
    State(state): State<AppState>,
    Json(req): Json<SpawnWorkerRequest>,
) -> ApiResult<Json<SuccessResponse<SpawnWorkerResponse>>> {
    let capabilities: HashSet<String> = req.capabilities.into_iter().collect();
    let runtime_kind = req.runtime.unwrap_or(RuntimeKind::Demo);
    let config = state.config.worker_config(runtime_kind);

    state
        .supervisor
        .spawn_worker(req.worker_id.clone(), capabilities, config)
        .await
        .ok_or_else(|| ApiError::InternalError("worker supervisor is not running".to_string()))?;

    Ok(Json(SuccessResponse::new(SpawnWorkerResponse {
        worker_id: req.worker_id,
    })))
}

async fn stop_worker(State(state): State<AppState>, Path(id): Path<String>) -> impl axum::response::IntoResponse {
    state.supervisor.stop_worker(id);
    response::no_content()
}

#[derive(Debug, Deserialize)]
struct TaskRequestBody {
    id: String,
    description: String,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    budget: Option<TaskBudget>,
    #[serde(default)]
    graph_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskAcceptedResponse {
    task_id: String,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<TaskRequestBody>,
) -> ApiResult<Json<SuccessResponse<TaskAcceptedResponse>>> {
    let mut spec = TaskSpec::new(req.id.clone(), req.description)
        .with_capabilities(req.required_capabilities.into_iter().collect());
    if let Some(budget) = req.budget {
        spec = spec.with_budget(budget);
    }
    if let Some(graph_id) = req.graph_id {
        spec = spec.with_graph_id(graph_id);
    }

    state.dispatcher.submit_task(spec, state.task_outcomes.clone());
    Ok(Json(SuccessResponse::new(TaskAcceptedResponse { task_id: req.id })))
}

#[derive(Debug, Deserialize)]
struct GraphNodeBody {
    id: String,
    description: String,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    budget: Option<TaskBudget>,
}

#[derive(Debug, Deserialize)]
struct SubmitGraphBody {
    graph_id: String,
    nodes: Vec<GraphNodeBody>,
    #[serde(default)]
    edges: Vec<(String, String)>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

async fn submit_graph(
    State(state): State<AppState>,
    Json(req): Json<SubmitGraphBody>,
) -> ApiResult<Json<GraphSubmitOutcome>> {
    let nodes = req
        .nodes
        .into_iter()
        .map(|n| {
            let mut spec = GraphNodeSpec::new(n.id, n.description)
                .with_capabilities(n.required_capabilities.into_iter().collect());
            if let Some(budget) = n.budget {
                spec = spec.with_budget(budget);
            }
            spec
        })
        .collect();

    let request = SubmitGraphRequest {
        nodes,
        edges: req.edges,
        deadline: req.deadline_ms.map(Duration::from_millis),
    };

    let outcome = state.graph.submit_graph(req.graph_id, request).await;
    Ok(Json(outcome))
}

async fn graph_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<GraphSnapshot>> {
    state
        .graph
        .graph_status(id.clone())
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("graph {id}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ApprovalDecision {
    Approved,
    Denied,
}

#[derive(Debug, Deserialize)]
struct ApprovalBody {
    decision: ApprovalDecision,
    #[serde(default)]
    reason: Option<String>,
}

async fn list_approvals(
    State(state): State<AppState>,
) -> Json<Vec<crate::dispatcher::PendingApprovalInfo>> {
    Json(state.dispatcher.list_pending_approvals().await)
}

async fn approve_or_deny(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<ApprovalBody>,
) -> impl axum::response::IntoResponse {
    match req.decision {
        ApprovalDecision::Approved => state.dispatcher.approve_risk(task_id),
        ApprovalDecision::Denied => {
            state.dispatcher.deny_risk(task_id, req.reason.unwrap_or_default())
        }
    }
    response::no_content()
}

#[derive(Debug, Deserialize)]
struct BlackboardPublishBody {
    key: String,
    value: String,
    #[serde(default)]
    publisher_id: Option<String>,
}

async fn blackboard_publish(
    State(state): State<AppState>,
    Json(req): Json<BlackboardPublishBody>,
) -> impl axum::response::IntoResponse {
    state.blackboard.publish(req.key, req.value, req.publisher_id);
    response::no_content()
}

#[derive(Debug, Serialize)]
struct BlackboardSignalResponse {
    key: String,
    value: String,
    publisher_id: Option<String>,
}

async fn blackboard_query(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<BlackboardSignalResponse>> {
    state
        .blackboard
        .query(key.clone())
        .await
        .map(|signal| {
            Json(BlackboardSignalResponse {
                key: key.clone(),
                value: signal.value,
                publisher_id: signal.publisher_id,
            })
        })
        .ok_or_else(|| ApiError::NotFound(format!("blackboard key {key}")))
}

#[derive(Debug, Deserialize)]
struct BlackboardListQuery {
    #[serde(default)]
    prefix: Option<String>,
}

async fn blackboard_list(
    State(state): State<AppState>,
    Query(query): Query<BlackboardListQuery>,
) -> Json<Vec<String>> {
    Json(state.blackboard.list(query.prefix).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::graph::GraphLimits;
    use crate::memory::InMemorySidecar;
    use crate::skill_registry::SkillRegistry;
    use crate::supervision::RestartPolicy;
    use crate::viewport::Viewport;
    use crate::worker::supervisor::WorkerSupervisor;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let event_bus = EventBus::new();
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), event_bus.clone());
        let supervisor = WorkerSupervisor::spawn(
            dispatcher.clone(),
            registry,
            Arc::new(InMemorySidecar::new()),
            event_bus.clone(),
            RestartPolicy::default(),
        );
        let graph = crate::graph::TaskGraph::spawn(dispatcher.clone(), event_bus.clone(), GraphLimits::default());
        let viewport = Viewport::spawn(event_bus.clone());
        let blackboard = crate::blackboard::Blackboard::spawn(event_bus);
        AppState {
            dispatcher,
            supervisor,
            graph,
            viewport,
            blackboard,
            config: AppConfig::default(),
            task_outcomes: task_outcome_logger(),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_ok() {
        let Json(resp) = health().await;
        assert_eq!(resp.status, "ok");
    }

    #[tokio::test]
    async fn test_spawn_then_stop_worker_round_trip() {
        let state = test_state();
        let req = SpawnWorkerRequest {
            worker_id: "w1".to_string(),
            capabilities: vec!["edit".to_string()],
            runtime: None,
        };
        let resp = spawn_worker(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(resp.0.data.worker_id, "w1");

        stop_worker(State(state), Path("w1".to_string())).await;
    }

    #[tokio::test]
    async fn test_submit_graph_rejects_cycle() {
        let state = test_state();
        let body = SubmitGraphBody {
            graph_id: "g1".to_string(),
            nodes: vec![
                GraphNodeBody {
                    id: "a".to_string(),
                    description: "a".to_string(),
                    required_capabilities: vec![],
                    budget: None,
                },
                GraphNodeBody {
                    id: "b".to_string(),
                    description: "b".to_string(),
                    required_capabilities: vec![],
                    budget: None,
                },
            ],
            edges: vec![("a".to_string(), "b".to_string()), ("b".to_string(), "a".to_string())],
            deadline_ms: None,
        };
        let Json(outcome) = submit_graph(State(state), Json(body)).await.unwrap();
        assert!(matches!(outcome, GraphSubmitOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_graph_status_not_found() {
        let state = test_state();
        let err = graph_status(State(state), Path("missing".to_string())).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_approvals_surfaces_pending_critical_task() {
        let state = test_state();
        let (reply, _outcome_mailbox) = actor::mailbox();
        let spec = TaskSpec::new("t1", "delete prod database")
            .with_budget(TaskBudget {
                risk: crate::RiskLevel::Critical,
                ..Default::default()
            });
        state.dispatcher.submit_task(spec, reply);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let Json(pending) = list_approvals(State(state)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "t1");
        assert_eq!(pending[0].risk, crate::RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_blackboard_publish_then_query() {
        let state = test_state();
        let body = BlackboardPublishBody {
            key: "agent.w1.mood".to_string(),
            value: "curious".to_string(),
            publisher_id: Some("w1".to_string()),
        };
        blackboard_publish(State(state.clone()), Json(body)).await;

        let Json(resp) = blackboard_query(State(state), Path("agent.w1.mood".to_string())).await.unwrap();
        assert_eq!(resp.value, "curious");
        assert_eq!(resp.publisher_id, Some("w1".to_string()));
    }

    #[tokio::test]
    async fn test_blackboard_query_missing_key_is_not_found() {
        let state = test_state();
        let err = blackboard_query(State(state), Path("ghost".to_string())).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blackboard_list_filters_by_prefix() {
        let state = test_state();
        blackboard_publish(
            State(state.clone()),
            Json(BlackboardPublishBody {
                key: "agent.w1.mood".to_string(),
                value: "x".to_string(),
                publisher_id: None,
            }),
        )
        .await;
        blackboard_publish(
            State(state.clone()),
            Json(BlackboardPublishBody {
                key: "graph.g1.status".to_string(),
                value: "y".to_string(),
                publisher_id: None,
            }),
        )
        .await;

        let Json(keys) = blackboard_list(
            State(state),
            Query(BlackboardListQuery {
                prefix: Some("agent.".to_string()),
            }),
        )
        .await;
        assert_eq!(keys, vec!["agent.w1.mood".to_string()]);
    }
}
