//! DAG task executor: validates submitted graphs, dispatches ready nodes,
//! handles progressive decomposition, cascades failure, and synthesizes
//! decomposed parents' results.
//!
//! One [`TaskGraph`] actor owns every submitted [`Graph`]'s state — nothing
//! else reads or writes a `Graph` directly, matching the rest of this crate's
//! rule that mutable state lives behind exactly one actor. Every node's
//! completion, wherever it originates (a plain task or a decomposed child),
//! arrives through the same bridged `OutcomeRef` built once at actor
//! construction and routed back into [`GraphMsg::NodeOutcome`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::actor::{self, forward_into, ActorRef, Mailbox};
use crate::dispatcher::DispatcherHandle;
use crate::events::EventBus;
use crate::task::{GraphToWorkerMsg, OutcomeRef, StopCondition, Subplan, TaskOutcome, TaskSpec};
use crate::{OrchestratorError, Result, TaskBudget};

/// One task node as supplied at submission time.
#[derive(Debug, Clone)]
pub struct GraphNodeSpec {
    pub id: String,
    pub description: String,
    pub required_capabilities: HashSet<String>,
    pub budget: Option<TaskBudget>,
}

impl GraphNodeSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required_capabilities: HashSet::new(),
            budget: None,
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
}

/// A graph submission: nodes, dependency edges `(from, to)` meaning `from`
/// must complete before `to` is dispatchable, and an optional graph-wide
/// deadline.
#[derive(Debug, Clone, Default)]
pub struct SubmitGraphRequest {
    pub nodes: Vec<GraphNodeSpec>,
    pub edges: Vec<(String, String)>,
    pub deadline: Option<Duration>,
}

/// Result of a [`SubmitTaskGraph`](GraphMsg::SubmitTaskGraph) request.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum GraphSubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Point-in-time read of one graph, for the status endpoint and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphSnapshot {
    pub graph_id: String,
    pub nodes: HashMap<String, NodeSnapshot>,
    pub completed: bool,
    pub results: HashMap<String, bool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeSnapshot {
    pub status: NodeStatus,
    pub depth: u32,
    pub parent: Option<String>,
}

/// A node's lifecycle state. `Ready` never persists at rest: a Pending node
/// with satisfied predecessors is dispatched synchronously within the same
/// dispatch pass, so nothing outside this module ever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Dispatched,
    WaitingForSubtasks,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled)
    }

    fn label(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Dispatched => "dispatched",
            NodeStatus::WaitingForSubtasks => "waiting_for_subtasks",
            NodeStatus::Synthesizing => "synthesizing",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

struct NodeState {
    description: String,
    required_capabilities: HashSet<String>,
    budget: Option<TaskBudget>,
    status: NodeStatus,
    depth: u32,
    parent: Option<String>,
    children: Vec<String>,
    stop_condition: Option<StopCondition>,
    notice_ref: Option<ActorRef<GraphToWorkerMsg>>,
    terminal_outcome: Option<TaskOutcome>,
}

struct Graph {
    nodes: HashMap<String, NodeState>,
    incoming: HashMap<String, HashSet<String>>,
    outgoing: HashMap<String, HashSet<String>>,
    completion_reply: Option<oneshot::Sender<HashMap<String, bool>>>,
}

impl Graph {
    fn ready_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(id, node)| {
                node.status == NodeStatus::Pending
                    && self
                        .incoming
                        .get(*id)
                        .map(|preds| {
                            preds
                                .iter()
                                .all(|p| self.nodes.get(p).map(|n| n.status == NodeStatus::Completed).unwrap_or(false))
                        })
                        .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    fn results(&self) -> HashMap<String, bool> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.status == NodeStatus::Completed))
            .collect()
    }
}

/// Messages accepted by the [`TaskGraph`] actor.
pub enum GraphMsg {
    SubmitTaskGraph {
        graph_id: String,
        request: SubmitGraphRequest,
        reply: oneshot::Sender<GraphSubmitOutcome>,
        completion_reply: Option<oneshot::Sender<HashMap<String, bool>>>,
    },
    GetGraphStatus {
        graph_id: String,
        reply: oneshot::Sender<Option<GraphSnapshot>>,
    },
    /// Internal: a node's task completed or failed, wherever it originated.
    NodeOutcome(TaskOutcome),
    /// Internal: a graph's deadline timer fired.
    GraphDeadlineFired { graph_id: String },
}

/// Cloneable handle to a running [`TaskGraph`] actor.
#[derive(Clone)]
pub struct GraphHandle {
    actor: ActorRef<GraphMsg>,
}

impl GraphHandle {
    pub async fn submit_graph(&self, graph_id: impl Into<String>, request: SubmitGraphRequest) -> GraphSubmitOutcome {
        let (reply, rx) = oneshot::channel();
        let graph_id = graph_id.into();
        if self
            .actor
            .send(GraphMsg::SubmitTaskGraph {
                graph_id,
                request,
                reply,
                completion_reply: None,
            })
            .is_err()
        {
            return GraphSubmitOutcome::Rejected("graph executor is not running".to_string());
        }
        rx.await
            .unwrap_or_else(|_| GraphSubmitOutcome::Rejected("graph executor dropped the reply".to_string()))
    }

    /// Like [`submit_graph`](Self::submit_graph), but also returns a
    /// receiver that resolves with the per-task success map once the graph
    /// completes — used by callers (tests, the HTTP boundary) that want to
    /// await the whole run rather than polling [`graph_status`](Self::graph_status).
    pub async fn submit_graph_awaiting_completion(
        &self,
        graph_id: impl Into<String>,
        request: SubmitGraphRequest,
    ) -> (GraphSubmitOutcome, Option<oneshot::Receiver<HashMap<String, bool>>>) {
        let (reply, rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let graph_id = graph_id.into();
        if self
            .actor
            .send(GraphMsg::SubmitTaskGraph {
                graph_id,
                request,
                reply,
                completion_reply: Some(completion_tx),
            })
            .is_err()
        {
            return (GraphSubmitOutcome::Rejected("graph executor is not running".to_string()), None);
        }
        let outcome = rx
            .await
            .unwrap_or_else(|_| GraphSubmitOutcome::Rejected("graph executor dropped the reply".to_string()));
        let completion = matches!(outcome, GraphSubmitOutcome::Accepted).then_some(completion_rx);
        (outcome, completion)
    }

    pub async fn graph_status(&self, graph_id: impl Into<String>) -> Option<GraphSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .actor
            .send(GraphMsg::GetGraphStatus {
                graph_id: graph_id.into(),
                reply,
            })
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub fn as_actor_ref(&self) -> ActorRef<GraphMsg> {
        self.actor.clone()
    }
}

/// Decomposition/graph-size limits, carried from the application config
/// (max subtasks per decomposition, max depth, max total nodes per graph).
#[derive(Debug, Clone, Copy)]
pub struct GraphLimits {
    pub max_subtasks: usize,
    pub max_depth: u32,
    pub max_total_nodes: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_subtasks: 10,
            max_depth: 3,
            max_total_nodes: 100,
        }
    }
}

/// The DAG executor actor.
pub struct TaskGraph {
    dispatcher: DispatcherHandle,
    event_bus: EventBus,
    outcome_ref: OutcomeRef,
    limits: GraphLimits,
    graphs: HashMap<String, Graph>,
}

impl TaskGraph {
    pub fn spawn(dispatcher: DispatcherHandle, event_bus: EventBus, limits: GraphLimits) -> GraphHandle {
        let (actor, mailbox) = actor::mailbox();
        let outcome_ref = forward_into(actor.clone(), GraphMsg::NodeOutcome);
        let graph = Self {
            dispatcher,
            event_bus,
            outcome_ref,
            limits,
            graphs: HashMap::new(),
        };
        actor::spawn_actor(move || graph.run(mailbox, actor.clone()));
        GraphHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<GraphMsg>, self_ref: ActorRef<GraphMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                GraphMsg::SubmitTaskGraph {
                    graph_id,
                    request,
                    reply,
                    completion_reply,
                } => {
                    let outcome = self.handle_submit(graph_id, request, completion_reply, &self_ref);
                    let _ = reply.send(outcome);
                }
                GraphMsg::GetGraphStatus { graph_id, reply } => {
                    let _ = reply.send(self.snapshot(&graph_id));
                }
                GraphMsg::NodeOutcome(outcome) => self.handle_node_outcome(outcome),
                GraphMsg::GraphDeadlineFired { graph_id } => self.handle_deadline(graph_id),
            }
        }
    }

    fn snapshot(&self, graph_id: &str) -> Option<GraphSnapshot> {
        let graph = self.graphs.get(graph_id)?;
        Some(GraphSnapshot {
            graph_id: graph_id.to_string(),
            nodes: graph
                .nodes
                .iter()
                .map(|(id, n)| {
                    (
                        id.clone(),
                        NodeSnapshot {
                            status: n.status,
                            depth: n.depth,
                            parent: n.parent.clone(),
                        },
                    )
                })
                .collect(),
            completed: graph.all_terminal(),
            results: graph.results(),
        })
    }

    fn handle_submit(
        &mut self,
        graph_id: String,
        request: SubmitGraphRequest,
        completion_reply: Option<oneshot::Sender<HashMap<String, bool>>>,
        self_ref: &ActorRef<GraphMsg>,
    ) -> GraphSubmitOutcome {
        match build_graph(&request) {
            Ok((mut nodes, incoming, outgoing)) => {
                for node in nodes.values_mut() {
                    node.depth = 0;
                }
                self.graphs.insert(
                    graph_id.clone(),
                    Graph {
                        nodes,
                        incoming,
                        outgoing,
                        completion_reply,
                    },
                );
                self.event_bus
                    .publish_viewport(crate::events::ViewportEvent::graph_submitted(&graph_id, true, None));

                if let Some(deadline) = request.deadline {
                    let timer_ref = self_ref.clone();
                    let timer_graph_id = graph_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(deadline).await;
                        let _ = timer_ref.send(GraphMsg::GraphDeadlineFired {
                            graph_id: timer_graph_id,
                        });
                    });
                }

                self.dispatch_ready(&graph_id);
                GraphSubmitOutcome::Accepted
            }
            Err(reason) => {
                self.event_bus.publish_viewport(crate::events::ViewportEvent::graph_submitted(
                    &graph_id,
                    false,
                    Some(reason.clone()),
                ));
                GraphSubmitOutcome::Rejected(reason)
            }
        }
    }

    fn dispatch_ready(&mut self, graph_id: &str) {
        let Some(graph) = self.graphs.get_mut(graph_id) else {
            return;
        };
        let ready = graph.ready_nodes();
        for node_id in ready {
            let Some(node) = graph.nodes.get_mut(&node_id) else {
                continue;
            };
            node.status = NodeStatus::Dispatched;
            let mut spec = TaskSpec::new(node_id.clone(), node.description.clone())
                .with_capabilities(node.required_capabilities.clone())
                .with_graph_id(graph_id.to_string());
            if let Some(budget) = node.budget.clone() {
                spec = spec.with_budget(budget);
            }
            self.dispatcher.submit_task(spec, self.outcome_ref.clone());
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::node_status_changed(graph_id, &node_id, "dispatched"));
        }
    }

    fn find_graph_for_task(&self, task_id: &str) -> Option<String> {
        self.graphs
            .iter()
            .find(|(_, g)| g.nodes.contains_key(task_id))
            .map(|(id, _)| id.clone())
    }

    fn handle_node_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Failed { task_id, reason, graph_id } => {
                let Some(gid) = graph_id.or_else(|| self.find_graph_for_task(&task_id)) else {
                    return;
                };
                self.mark_failed(&gid, &task_id, reason);
            }
            TaskOutcome::Completed {
                task_id,
                summary,
                subplan,
                graph_id,
                notice_ref,
            } => {
                let Some(gid) = graph_id.or_else(|| self.find_graph_for_task(&task_id)) else {
                    return;
                };
                if let Some(subplan) = subplan {
                    self.handle_decomposition(&gid, &task_id, subplan, notice_ref);
                } else {
                    self.mark_completed(&gid, &task_id, summary);
                }
            }
        }
    }

    fn mark_failed(&mut self, gid: &str, task_id: &str, reason: String) {
        {
            let Some(graph) = self.graphs.get_mut(gid) else {
                return;
            };
            let Some(node) = graph.nodes.get_mut(task_id) else {
                return;
            };
            node.status = NodeStatus::Failed;
            node.terminal_outcome = Some(TaskOutcome::Failed {
                task_id: task_id.to_string(),
                reason: reason.clone(),
                graph_id: Some(gid.to_string()),
            });
        }
        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, task_id, "failed"));
        self.cancel_dependents(gid, task_id);

        let parent = self.graphs.get(gid).and_then(|g| g.nodes.get(task_id)).and_then(|n| n.parent.clone());
        if let Some(parent_id) = parent {
            self.check_parent_stop_condition(gid, &parent_id);
        }
        self.check_graph_completion(gid);
    }

    fn mark_completed(&mut self, gid: &str, task_id: &str, summary: Option<String>) {
        {
            let Some(graph) = self.graphs.get_mut(gid) else {
                return;
            };
            let Some(node) = graph.nodes.get_mut(task_id) else {
                return;
            };
            node.status = NodeStatus::Completed;
            node.terminal_outcome = Some(TaskOutcome::Completed {
                task_id: task_id.to_string(),
                summary,
                subplan: None,
                graph_id: Some(gid.to_string()),
                notice_ref: None,
            });
        }
        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, task_id, "completed"));
        self.dispatch_ready(gid);

        let parent = self.graphs.get(gid).and_then(|g| g.nodes.get(task_id)).and_then(|n| n.parent.clone());
        if let Some(parent_id) = parent {
            self.check_parent_stop_condition(gid, &parent_id);
        }
        self.check_graph_completion(gid);
    }

    /// BFS over outgoing edges, cancelling every `Pending` node reachable
    /// from `start` — a node already `Dispatched` is left alone, since it is
    /// independently in flight rather than blocked on `start`.
    fn cancel_dependents(&mut self, gid: &str, start: &str) {
        let Some(graph) = self.graphs.get_mut(gid) else {
            return;
        };
        let mut queue: VecDeque<String> = graph.outgoing.get(start).into_iter().flatten().cloned().collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cancelled = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(node) = graph.nodes.get_mut(&id) else {
                continue;
            };
            if node.status == NodeStatus::Pending {
                node.status = NodeStatus::Cancelled;
                node.terminal_outcome = Some(TaskOutcome::Failed {
                    task_id: id.clone(),
                    reason: "cancelled: an upstream dependency failed".to_string(),
                    graph_id: Some(gid.to_string()),
                });
                cancelled.push(id.clone());
                if let Some(next) = graph.outgoing.get(&id) {
                    queue.extend(next.iter().cloned());
                }
            }
        }

        for id in cancelled {
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, &id, "cancelled"));
        }
    }

    fn check_parent_stop_condition(&mut self, gid: &str, parent_id: &str) {
        let Some(graph) = self.graphs.get(gid) else {
            return;
        };
        let Some(parent) = graph.nodes.get(parent_id) else {
            return;
        };
        if parent.status != NodeStatus::WaitingForSubtasks {
            return;
        }
        let children = parent.children.clone();
        let stop_condition = parent.stop_condition.unwrap_or_default();

        let any_succeeded = children
            .iter()
            .any(|c| graph.nodes.get(c).map(|n| n.status == NodeStatus::Completed).unwrap_or(false));
        let all_terminal = children.iter().all(|c| graph.nodes.get(c).map(|n| n.status.is_terminal()).unwrap_or(true));

        match stop_condition {
            StopCondition::FirstSuccess if any_succeeded => {
                self.cancel_nonterminal_siblings(gid, &children);
                self.trigger_synthesis(gid, parent_id);
            }
            // AllSubtasksComplete's rule, and the fallback for FirstSuccess
            // with no success and UserDecision (escalation is outside this
            // core, so the graph still needs to make forward progress once
            // every child has run out of road).
            _ if all_terminal => {
                self.trigger_synthesis(gid, parent_id);
            }
            _ => {}
        }
    }

    fn cancel_nonterminal_siblings(&mut self, gid: &str, children: &[String]) {
        let mut cancelled = Vec::new();
        if let Some(graph) = self.graphs.get_mut(gid) {
            for child_id in children {
                if let Some(node) = graph.nodes.get_mut(child_id) {
                    if !node.status.is_terminal() {
                        node.status = NodeStatus::Cancelled;
                        node.terminal_outcome = Some(TaskOutcome::Failed {
                            task_id: child_id.clone(),
                            reason: "cancelled: sibling already succeeded".to_string(),
                            graph_id: Some(gid.to_string()),
                        });
                        cancelled.push(child_id.clone());
                    }
                }
            }
        }
        for id in cancelled {
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, &id, "cancelled"));
        }
    }

    fn trigger_synthesis(&mut self, gid: &str, parent_id: &str) {
        let (notice_ref, children, results) = {
            let Some(graph) = self.graphs.get_mut(gid) else {
                return;
            };
            let Some(parent) = graph.nodes.get_mut(parent_id) else {
                return;
            };
            parent.status = NodeStatus::Synthesizing;
            let notice_ref = parent.notice_ref.clone();
            let children = parent.children.clone();
            let results: Vec<(String, TaskOutcome)> = children
                .iter()
                .filter_map(|c| graph.nodes.get(c).and_then(|n| n.terminal_outcome.clone()).map(|o| (c.clone(), o)))
                .collect();
            (notice_ref, children, results)
        };
        let _ = children;

        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, parent_id, "synthesizing"));

        if let Some(notice_ref) = notice_ref {
            let _ = notice_ref.send(GraphToWorkerMsg::SubtasksCompleted {
                parent_id: parent_id.to_string(),
                results,
            });
        } else {
            tracing::warn!(graph_id = gid, parent_id, "no notice channel to synthesize through; failing parent");
            self.mark_failed(gid, parent_id, "no worker available to synthesize subtask results".to_string());
        }
    }

    fn handle_decomposition(&mut self, gid: &str, task_id: &str, subplan: Subplan, notice_ref: Option<ActorRef<GraphToWorkerMsg>>) {
        let parent_depth = match self.graphs.get(gid).and_then(|g| g.nodes.get(task_id)) {
            Some(node) => node.depth,
            None => return,
        };

        if let Err(reason) = validate_subplan(&subplan, parent_depth, self.graphs[gid].nodes.len(), &self.limits) {
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, task_id, "decomposition_rejected"));
            if let Some(notice_ref) = notice_ref {
                let _ = notice_ref.send(GraphToWorkerMsg::DecompositionRejected {
                    parent_id: task_id.to_string(),
                    reason,
                });
            }
            return;
        }

        let child_ids: Vec<String> = (0..subplan.subtasks.len()).map(|i| format!("{task_id}/sub-{i}")).collect();

        {
            let graph = self.graphs.get_mut(gid).expect("graph present");
            for (i, subtask) in subplan.subtasks.iter().enumerate() {
                let child_id = child_ids[i].clone();
                graph.nodes.insert(
                    child_id.clone(),
                    NodeState {
                        description: subtask.description.clone(),
                        required_capabilities: subtask.required_capabilities.clone(),
                        budget: subtask.budget.clone(),
                        status: NodeStatus::Pending,
                        depth: parent_depth + 1,
                        parent: Some(task_id.to_string()),
                        children: Vec::new(),
                        stop_condition: None,
                        notice_ref: None,
                        terminal_outcome: None,
                    },
                );
                graph.incoming.entry(child_id.clone()).or_default();
                graph.outgoing.entry(child_id.clone()).or_default();
            }
            for (from, to) in &subplan.dependencies {
                let from_id = &child_ids[*from];
                let to_id = &child_ids[*to];
                graph.incoming.entry(to_id.clone()).or_default().insert(from_id.clone());
                graph.outgoing.entry(from_id.clone()).or_default().insert(to_id.clone());
            }

            let parent = graph.nodes.get_mut(task_id).expect("parent present");
            parent.status = NodeStatus::WaitingForSubtasks;
            parent.children = child_ids.clone();
            parent.stop_condition = Some(subplan.stop_condition);
            parent.notice_ref = notice_ref.clone();
        }

        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(gid, task_id, "waiting_for_subtasks"));

        if let Some(notice_ref) = notice_ref {
            let _ = notice_ref.send(GraphToWorkerMsg::DecompositionAccepted {
                parent_id: task_id.to_string(),
                child_ids,
            });
        }

        self.dispatch_ready(gid);
    }

    fn handle_deadline(&mut self, graph_id: String) {
        let Some(graph) = self.graphs.get_mut(&graph_id) else {
            return;
        };
        let mut changed = Vec::new();
        for (id, node) in graph.nodes.iter_mut() {
            match node.status {
                NodeStatus::Dispatched | NodeStatus::WaitingForSubtasks | NodeStatus::Synthesizing => {
                    node.status = NodeStatus::Failed;
                    node.terminal_outcome = Some(TaskOutcome::Failed {
                        task_id: id.clone(),
                        reason: "graph deadline exceeded".to_string(),
                        graph_id: Some(graph_id.clone()),
                    });
                    changed.push((id.clone(), "failed"));
                }
                NodeStatus::Pending => {
                    node.status = NodeStatus::Cancelled;
                    node.terminal_outcome = Some(TaskOutcome::Failed {
                        task_id: id.clone(),
                        reason: "cancelled: graph deadline exceeded".to_string(),
                        graph_id: Some(graph_id.clone()),
                    });
                    changed.push((id.clone(), "cancelled"));
                }
                _ => {}
            }
        }
        for (id, status) in changed {
            self.event_bus
                .publish_viewport(crate::events::ViewportEvent::node_status_changed(&graph_id, &id, status));
        }
        self.check_graph_completion(&graph_id);
    }

    fn check_graph_completion(&mut self, gid: &str) {
        let Some(graph) = self.graphs.get(gid) else {
            return;
        };
        if !graph.all_terminal() {
            return;
        }
        let results = graph.results();
        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::graph_completed(gid, results.clone()));
        if let Some(graph) = self.graphs.remove(gid) {
            if let Some(reply) = graph.completion_reply {
                let _ = reply.send(results);
            }
        }
    }
}

/// Validate a submission's structural integrity and build its adjacency
/// maps: no duplicate ids, every edge endpoint exists, and the edge set is
/// acyclic (verified via Kahn's algorithm).
fn build_graph(
    request: &SubmitGraphRequest,
) -> std::result::Result<(HashMap<String, NodeState>, HashMap<String, HashSet<String>>, HashMap<String, HashSet<String>>), String> {
    let mut nodes = HashMap::new();
    for spec in &request.nodes {
        if nodes.contains_key(&spec.id) {
            return Err(format!("duplicate task id: {}", spec.id));
        }
        nodes.insert(
            spec.id.clone(),
            NodeState {
                description: spec.description.clone(),
                required_capabilities: spec.required_capabilities.clone(),
                budget: spec.budget.clone(),
                status: NodeStatus::Pending,
                depth: 0,
                parent: None,
                children: Vec::new(),
                stop_condition: None,
                notice_ref: None,
                terminal_outcome: None,
            },
        );
    }

    let mut incoming: HashMap<String, HashSet<String>> = nodes.keys().map(|id| (id.clone(), HashSet::new())).collect();
    let mut outgoing: HashMap<String, HashSet<String>> = nodes.keys().map(|id| (id.clone(), HashSet::new())).collect();
    for (from, to) in &request.edges {
        if !nodes.contains_key(from) {
            return Err(format!("edge references unknown task id: {from}"));
        }
        if !nodes.contains_key(to) {
            return Err(format!("edge references unknown task id: {to}"));
        }
        incoming.get_mut(to).unwrap().insert(from.clone());
        outgoing.get_mut(from).unwrap().insert(to.clone());
    }

    if let Some(cycle_members) = find_cycle(nodes.keys().cloned().collect(), &incoming) {
        return Err(format!("graph contains a cycle among: {}", cycle_members.join(", ")));
    }

    Ok((nodes, incoming, outgoing))
}

/// Kahn's algorithm: returns the ids that never reached indegree zero (i.e.
/// participate in a cycle), or `None` if the graph is acyclic.
fn find_cycle(ids: HashSet<String>, incoming: &HashMap<String, HashSet<String>>) -> Option<Vec<String>> {
    let mut indegree: HashMap<String, usize> = ids.iter().map(|id| (id.clone(), incoming.get(id).map(HashSet::len).unwrap_or(0))).collect();
    let mut queue: VecDeque<String> = indegree.iter().filter(|(_, &d)| d == 0).map(|(id, _)| id.clone()).collect();
    let mut outgoing_of: HashMap<&String, Vec<&String>> = HashMap::new();
    for (to, preds) in incoming {
        for from in preds {
            outgoing_of.entry(from).or_default().push(to);
        }
    }

    let mut processed = 0;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(successors) = outgoing_of.get(&id) {
            for succ in successors {
                let d = indegree.get_mut(*succ).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back((*succ).clone());
                }
            }
        }
    }

    if processed == ids.len() {
        None
    } else {
        let mut remaining: Vec<String> = indegree.into_iter().filter(|(_, d)| *d > 0).map(|(id, _)| id).collect();
        remaining.sort();
        Some(remaining)
    }
}

/// Evaluate a proposed decomposition against the size/depth limits and its
/// own internal acyclicity; `Err` carries the rejection reason.
fn validate_subplan(subplan: &Subplan, parent_depth: u32, graph_node_count: usize, limits: &GraphLimits) -> std::result::Result<(), String> {
    let subtask_count = subplan.subtasks.len();
    if subtask_count > limits.max_subtasks {
        return Err(format!("subtask count {subtask_count} exceeds the limit of {}", limits.max_subtasks));
    }
    if parent_depth + 1 > limits.max_depth {
        return Err(format!("decomposition would exceed max depth of {}", limits.max_depth));
    }
    if graph_node_count + subtask_count > limits.max_total_nodes {
        return Err(format!("graph would exceed the limit of {} total nodes", limits.max_total_nodes));
    }
    for (from, to) in &subplan.dependencies {
        if *from >= subtask_count || *to >= subtask_count {
            return Err(format!("dependency index out of range: ({from}, {to})"));
        }
    }

    let local_ids: HashSet<String> = (0..subtask_count).map(|i| i.to_string()).collect();
    let local_incoming: HashMap<String, HashSet<String>> = {
        let mut incoming: HashMap<String, HashSet<String>> = local_ids.iter().map(|id| (id.clone(), HashSet::new())).collect();
        for (from, to) in &subplan.dependencies {
            incoming.get_mut(&to.to_string()).unwrap().insert(from.to_string());
        }
        incoming
    };
    if find_cycle(local_ids, &local_incoming).is_some() {
        return Err("proposed subplan's dependencies contain a cycle".to_string());
    }

    Ok(())
}

/// Helper used by the HTTP boundary to surface graph validation failures as
/// the crate-wide error type.
pub fn submit_outcome_to_result(graph_id: &str, outcome: GraphSubmitOutcome) -> Result<()> {
    match outcome {
        GraphSubmitOutcome::Accepted => Ok(()),
        GraphSubmitOutcome::Rejected(reason) => Err(OrchestratorError::GraphInvalid(format!("{graph_id}: {reason}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::memory::InMemorySidecar;
    use crate::skill_registry::SkillRegistry;
    use crate::worker::{Worker, WorkerConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn test_dispatcher() -> (DispatcherHandle, crate::skill_registry::SkillRegistryHandle) {
        let registry = SkillRegistry::spawn();
        let dispatcher = Dispatcher::spawn(registry.clone(), Duration::from_millis(30), EventBus::new());
        (dispatcher, registry)
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let graph = TaskGraph::spawn(test_dispatcher().0, EventBus::new(), GraphLimits::default());
        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("a", "x"), GraphNodeSpec::new("a", "y")],
            edges: vec![],
            deadline: None,
        };
        let outcome = graph.submit_graph("g1", request).await;
        match outcome {
            GraphSubmitOutcome::Rejected(reason) => assert!(reason.contains("duplicate")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edge_references_unknown_node_rejected() {
        let graph = TaskGraph::spawn(test_dispatcher().0, EventBus::new(), GraphLimits::default());
        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("a", "x")],
            edges: vec![("a".to_string(), "ghost".to_string())],
            deadline: None,
        };
        let outcome = graph.submit_graph("g1", request).await;
        match outcome {
            GraphSubmitOutcome::Rejected(reason) => assert!(reason.contains("unknown task id")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        // S3: A -> B -> C -> A
        let graph = TaskGraph::spawn(test_dispatcher().0, EventBus::new(), GraphLimits::default());
        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("a", "x"), GraphNodeSpec::new("b", "y"), GraphNodeSpec::new("c", "z")],
            edges: vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "c".to_string()),
                ("c".to_string(), "a".to_string()),
            ],
            deadline: None,
        };
        let outcome = graph.submit_graph("g1", request).await;
        match outcome {
            GraphSubmitOutcome::Rejected(reason) => assert!(reason.contains("cycle")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_task_happy_path() {
        // S1: one node, one capable demo worker, expect eventual completion.
        let (dispatcher, registry) = test_dispatcher();
        let event_bus = EventBus::new();
        let graph = TaskGraph::spawn(dispatcher.clone(), event_bus.clone(), GraphLimits::default());

        let sidecar = Arc::new(InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit"]),
            WorkerConfig::default(),
            dispatcher.clone(),
            registry,
            sidecar,
            event_bus,
        );
        dispatcher.register_worker("w1", worker);

        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("t", "write code").with_capabilities(caps(&["edit"]))],
            edges: vec![],
            deadline: None,
        };
        let (outcome, completion) = graph.submit_graph_awaiting_completion("g1", request).await;
        assert_eq!(outcome, GraphSubmitOutcome::Accepted);

        let results = tokio::time::timeout(Duration::from_secs(5), completion.unwrap())
            .await
            .expect("graph should complete")
            .unwrap();
        assert_eq!(results.get("t"), Some(&true));
    }

    #[tokio::test]
    async fn test_deadline_cascade() {
        // S5: A -> B, A has a short deadline and never completes naturally
        // within it (the demo runtime's cycle takes ~800ms); expect both
        // nodes to fail/cancel without B ever dispatching.
        let (dispatcher, registry) = test_dispatcher();
        let event_bus = EventBus::new();
        let graph = TaskGraph::spawn(dispatcher.clone(), event_bus.clone(), GraphLimits::default());

        let sidecar = Arc::new(InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit"]),
            WorkerConfig::default(),
            dispatcher.clone(),
            registry,
            sidecar,
            event_bus,
        );
        dispatcher.register_worker("w1", worker);

        let request = SubmitGraphRequest {
            nodes: vec![
                GraphNodeSpec::new("a", "slow").with_capabilities(caps(&["edit"])).with_budget(TaskBudget {
                    deadline: Some(Duration::from_millis(30)),
                    ..Default::default()
                }),
                GraphNodeSpec::new("b", "depends on a").with_capabilities(caps(&["edit"])),
            ],
            edges: vec![("a".to_string(), "b".to_string())],
            deadline: None,
        };
        let (outcome, completion) = graph.submit_graph_awaiting_completion("g1", request).await;
        assert_eq!(outcome, GraphSubmitOutcome::Accepted);

        let results = tokio::time::timeout(Duration::from_secs(5), completion.unwrap())
            .await
            .expect("graph should complete")
            .unwrap();
        assert_eq!(results.get("a"), Some(&false));
        assert_eq!(results.get("b"), Some(&false));
    }

    #[tokio::test]
    async fn test_decomposition_accept_and_first_success_synthesis() {
        // S4-flavored: no capable workers for the children, so each fails
        // immediately with NoCapableWorker; under FirstSuccess that still
        // has to make forward progress once every child is terminal.
        let dispatcher = test_dispatcher().0;
        let graph = TaskGraph::spawn(dispatcher, EventBus::new(), GraphLimits::default());

        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("t", "needs decomposition")],
            edges: vec![],
            deadline: None,
        };
        let outcome = graph.submit_graph("g1", request).await;
        assert_eq!(outcome, GraphSubmitOutcome::Accepted);

        let (notice_ref, mut notice_mailbox) = actor::mailbox::<GraphToWorkerMsg>();
        let subplan = Subplan {
            stop_condition: StopCondition::FirstSuccess,
            subtasks: vec![
                crate::task::SubtaskSpec {
                    description: "child 0".to_string(),
                    required_capabilities: HashSet::new(),
                    budget: None,
                },
                crate::task::SubtaskSpec {
                    description: "child 1".to_string(),
                    required_capabilities: HashSet::new(),
                    budget: None,
                },
            ],
            dependencies: vec![],
        };
        graph
            .as_actor_ref()
            .send(GraphMsg::NodeOutcome(TaskOutcome::Completed {
                task_id: "t".to_string(),
                summary: None,
                subplan: Some(subplan),
                graph_id: Some("g1".to_string()),
                notice_ref: Some(notice_ref),
            }))
            .unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(2), notice_mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        match accepted {
            GraphToWorkerMsg::DecompositionAccepted { parent_id, child_ids } => {
                assert_eq!(parent_id, "t");
                assert_eq!(child_ids, vec!["t/sub-0".to_string(), "t/sub-1".to_string()]);
            }
            other => panic!("expected DecompositionAccepted, got {other:?}"),
        }

        let synthesized = tokio::time::timeout(Duration::from_secs(2), notice_mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        match synthesized {
            GraphToWorkerMsg::SubtasksCompleted { parent_id, results } => {
                assert_eq!(parent_id, "t");
                assert_eq!(results.len(), 2);
            }
            other => panic!("expected SubtasksCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decomposition_rejected_when_too_many_subtasks() {
        let dispatcher = test_dispatcher().0;
        let graph = TaskGraph::spawn(
            dispatcher,
            EventBus::new(),
            GraphLimits {
                max_subtasks: 2,
                ..GraphLimits::default()
            },
        );
        let request = SubmitGraphRequest {
            nodes: vec![GraphNodeSpec::new("t", "needs decomposition")],
            edges: vec![],
            deadline: None,
        };
        graph.submit_graph("g1", request).await;

        let (notice_ref, mut notice_mailbox) = actor::mailbox::<GraphToWorkerMsg>();
        let subplan = Subplan {
            stop_condition: StopCondition::AllSubtasksComplete,
            subtasks: (0..3)
                .map(|i| crate::task::SubtaskSpec {
                    description: format!("child {i}"),
                    required_capabilities: HashSet::new(),
                    budget: None,
                })
                .collect(),
            dependencies: vec![],
        };
        graph
            .as_actor_ref()
            .send(GraphMsg::NodeOutcome(TaskOutcome::Completed {
                task_id: "t".to_string(),
                summary: None,
                subplan: Some(subplan),
                graph_id: Some("g1".to_string()),
                notice_ref: Some(notice_ref),
            }))
            .unwrap();

        let rejected = tokio::time::timeout(Duration::from_secs(2), notice_mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        match rejected {
            GraphToWorkerMsg::DecompositionRejected { parent_id, reason } => {
                assert_eq!(parent_id, "t");
                assert!(reason.contains("exceeds"));
            }
            other => panic!("expected DecompositionRejected, got {other:?}"),
        }
    }
}
