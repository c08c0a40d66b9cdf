//! The worker agent: bids for work, runs one task at a time through its
//! runtime, and writes what it learned back to the memory layers.
//!
//! A worker never calls the dispatcher's internals directly — it only ever
//! computes a fitness score and sends a [`Bid`](crate::task::Bid) back. Once
//! assigned, it queries the knowledge store for anything relevant (bounded
//! to a few seconds, degrading to no context on timeout), forwards a prompt
//! assembled from the task description plus that context to its runtime,
//! and reacts to whatever the runtime reports.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::actor::{self, forward_into, ActorRef, Mailbox};
use crate::events::EventBus;
use crate::memory::sidecar::SidecarClient;
use crate::memory::{KnowledgeCategory, KnowledgeEntry, KnowledgeHandle, KnowledgeStore, MemoryHandle, MemoryStore};
use crate::skill_registry::SkillRegistryHandle;
use crate::task::{Bid, GraphToWorkerMsg, OutcomeRef, Subplan, TaskOutcome, TaskSpec};
use crate::dispatcher::DispatcherHandle;

use super::runtime::{RuntimeHandle, WorkerRuntime};
use super::tasks::{WorkerTasksHandle, WorkerTasks};
use super::types::{ActivityState, RuntimeKind};

/// Tunables for a single worker. Defaults favor the demo runtime and a
/// conservative concurrency limit so a freshly spawned worker is immediately
/// useful without any configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency_limit: usize,
    pub min_bid_threshold: f64,
    pub knowledge_timeout: Duration,
    pub memory_commit_debounce: Duration,
    pub runtime_kind: RuntimeKind,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            min_bid_threshold: 0.5,
            knowledge_timeout: Duration::from_secs(5),
            memory_commit_debounce: Duration::from_secs(5),
            runtime_kind: RuntimeKind::Demo,
        }
    }
}

/// Messages accepted by the [`Worker`] actor.
pub enum WorkerMsg {
    /// The dispatcher is opening an auction this worker may bid in.
    TaskAvailable {
        task_id: String,
        description: String,
        required_capabilities: HashSet<String>,
        bid_window: Duration,
    },
    /// This worker's bid lost the auction.
    BidRejected { task_id: String },
    /// This worker won the auction and should begin work.
    TaskAssigned { spec: TaskSpec, reply_to: OutcomeRef },
    /// A decomposition this worker proposed was accepted or rejected, or its
    /// children have all finished and it should synthesize a result.
    GraphNotice(GraphToWorkerMsg),

    // -- internal / runtime-facing --
    RuntimeActivity { state: ActivityState },
    RuntimeLine { line: String },
    RuntimeTaskComplete { task_id: String, summary: Option<String>, estimated_tokens: u64 },
    RuntimeTaskFailed { task_id: String, reason: String, estimated_tokens: u64 },
    /// The runtime proposed decomposing `task_id` into subtasks; `json` is
    /// the still-encoded payload to parse into a `Subplan`.
    RuntimeTaskDecompose { task_id: String, json: String },
    RuntimeTokenBudgetExceeded { task_id: String, estimated: u64, max: u64 },
    RuntimeExited { exit_code: Option<i32> },
    TaskDeadlineExceeded { task_id: String },
    /// Internal: a knowledge query for an assigned task finished (or timed out).
    KnowledgeReady {
        spec: TaskSpec,
        reply_to: OutcomeRef,
        entries: Vec<KnowledgeEntry>,
    },
    Stop,
}

/// Cloneable handle to a running [`Worker`] actor.
#[derive(Clone)]
pub struct WorkerHandle {
    actor: ActorRef<WorkerMsg>,
}

impl WorkerHandle {
    pub fn task_available(
        &self,
        task_id: impl Into<String>,
        description: impl Into<String>,
        required_capabilities: HashSet<String>,
        bid_window: Duration,
    ) {
        let _ = self.actor.send(WorkerMsg::TaskAvailable {
            task_id: task_id.into(),
            description: description.into(),
            required_capabilities,
            bid_window,
        });
    }

    pub fn bid_rejected(&self, task_id: impl Into<String>) {
        let _ = self.actor.send(WorkerMsg::BidRejected {
            task_id: task_id.into(),
        });
    }

    pub fn task_assigned(&self, spec: TaskSpec, reply_to: OutcomeRef) {
        let _ = self.actor.send(WorkerMsg::TaskAssigned { spec, reply_to });
    }

    pub fn stop(&self) {
        let _ = self.actor.send(WorkerMsg::Stop);
    }

    pub fn as_actor_ref(&self) -> ActorRef<WorkerMsg> {
        self.actor.clone()
    }
}

struct ActiveTask {
    reply_to: OutcomeRef,
    graph_id: Option<String>,
}

/// The worker agent. Owns one runtime, one active-task tracker, and its own
/// memory/knowledge handles into the shared sidecar.
pub struct Worker {
    id: String,
    capabilities: HashSet<String>,
    config: WorkerConfig,
    dispatcher: DispatcherHandle,
    registry: SkillRegistryHandle,
    event_bus: EventBus,
    runtime: RuntimeHandle,
    tasks: WorkerTasksHandle,
    knowledge: KnowledgeHandle,
    memory: MemoryHandle,
    active: HashMap<String, ActiveTask>,
    current_runtime_task: Option<String>,
    self_ref: ActorRef<WorkerMsg>,
}

impl Worker {
    /// Spawn a worker and return only its handle, discarding the join handle
    /// of its background task. Used directly by callers (tests, simple
    /// standalone setups) that don't need supervision.
    pub fn spawn(
        id: impl Into<String>,
        capabilities: HashSet<String>,
        config: WorkerConfig,
        dispatcher: DispatcherHandle,
        registry: SkillRegistryHandle,
        sidecar: Arc<dyn SidecarClient>,
        event_bus: EventBus,
    ) -> WorkerHandle {
        let (handle, _join) =
            Self::spawn_supervised(id, capabilities, config, dispatcher, registry, sidecar, event_bus);
        handle
    }

    /// Spawn a worker and return both its handle and the `tokio` task's
    /// `JoinHandle`, so a supervisor can detect the actor's loop exiting.
    pub fn spawn_supervised(
        id: impl Into<String>,
        capabilities: HashSet<String>,
        config: WorkerConfig,
        dispatcher: DispatcherHandle,
        registry: SkillRegistryHandle,
        sidecar: Arc<dyn SidecarClient>,
        event_bus: EventBus,
    ) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
        let id = id.into();
        let (actor, mailbox) = actor::mailbox();

        let runtime = WorkerRuntime::spawn(id.clone(), config.runtime_kind.clone(), actor.clone(), event_bus.clone());
        let tasks = WorkerTasks::spawn(id.clone(), actor.clone(), event_bus.clone());
        let knowledge = KnowledgeStore::spawn(id.clone(), sidecar.clone());
        let memory = MemoryStore::spawn(id.clone(), sidecar, config.memory_commit_debounce);

        registry.register(id.clone(), capabilities.clone());
        event_bus.publish_viewport(crate::events::ViewportEvent::worker_spawned(
            id.clone(),
            capabilities.iter().cloned().collect(),
        ));

        let worker = Self {
            id,
            capabilities,
            config,
            dispatcher,
            registry,
            event_bus,
            runtime,
            tasks,
            knowledge,
            memory,
            active: HashMap::new(),
            current_runtime_task: None,
            self_ref: actor.clone(),
        };
        let join = actor::spawn_actor(move || worker.run(mailbox));
        (WorkerHandle { actor }, join)
    }

    async fn run(mut self, mut mailbox: Mailbox<WorkerMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                WorkerMsg::TaskAvailable {
                    task_id,
                    description,
                    required_capabilities,
                    bid_window,
                } => self.handle_task_available(task_id, description, required_capabilities, bid_window),
                WorkerMsg::BidRejected { .. } => {}
                WorkerMsg::TaskAssigned { spec, reply_to } => self.handle_task_assigned(spec, reply_to),
                WorkerMsg::GraphNotice(notice) => self.handle_graph_notice(notice),
                WorkerMsg::KnowledgeReady { spec, reply_to, entries } => {
                    self.handle_knowledge_ready(spec, reply_to, entries)
                }
                WorkerMsg::RuntimeActivity { state } => {
                    self.event_bus
                        .publish_viewport(crate::events::ViewportEvent::worker_state_changed(
                            &self.id,
                            state.to_string(),
                        ));
                }
                WorkerMsg::RuntimeLine { .. } => {}
                WorkerMsg::RuntimeTaskComplete { task_id, summary, estimated_tokens } => {
                    self.handle_runtime_complete(task_id, summary, estimated_tokens)
                }
                WorkerMsg::RuntimeTaskFailed { task_id, reason, estimated_tokens } => {
                    self.handle_runtime_failed(task_id, reason, estimated_tokens)
                }
                WorkerMsg::RuntimeTaskDecompose { task_id, json } => self.handle_runtime_decompose(task_id, json),
                WorkerMsg::RuntimeTokenBudgetExceeded { task_id, estimated, max } => {
                    self.handle_token_budget_exceeded(task_id, estimated, max)
                }
                WorkerMsg::RuntimeExited { exit_code } => self.handle_runtime_exited(exit_code),
                WorkerMsg::TaskDeadlineExceeded { task_id } => self.handle_deadline_exceeded(task_id),
                WorkerMsg::Stop => break,
            }
        }

        self.registry.unregister(self.id.clone());
        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::worker_despawned(&self.id));
    }

    fn fitness(&self, required: &HashSet<String>) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let satisfied = required.intersection(&self.capabilities).count();
        satisfied as f64 / required.len() as f64
    }

    fn handle_task_available(
        &mut self,
        task_id: String,
        _description: String,
        required_capabilities: HashSet<String>,
        _bid_window: Duration,
    ) {
        if self.active.len() >= self.config.concurrency_limit {
            return;
        }
        let fitness = self.fitness(&required_capabilities);
        if fitness < self.config.min_bid_threshold {
            return;
        }
        self.dispatcher.submit_bid(Bid {
            task_id,
            worker_id: self.id.clone(),
            fitness,
            active_count: self.active.len(),
            estimated_duration: Duration::from_millis(500 + self.active.len() as u64 * 100),
        });
    }

    fn handle_task_assigned(&mut self, spec: TaskSpec, reply_to: OutcomeRef) {
        let task_id = spec.id.clone();
        let graph_id = spec.graph_id.clone();
        let max_tokens = spec.budget.as_ref().and_then(|b| b.max_tokens);

        self.active.insert(
            task_id.clone(),
            ActiveTask {
                reply_to: reply_to.clone(),
                graph_id,
            },
        );
        self.tasks.task_assigned(task_id.clone(), spec.budget.clone());
        self.runtime.set_active_task(task_id.clone(), max_tokens);
        self.current_runtime_task = Some(task_id);

        let knowledge = self.knowledge.clone();
        let self_ref = self.self_ref.clone();
        let timeout = self.config.knowledge_timeout;
        let query = spec.description.clone();
        tokio::spawn(async move {
            let entries = if query.is_empty() {
                Vec::new()
            } else {
                // `KnowledgeHandle::query` never itself fails (a sidecar error
                // already degrades to an empty `Vec` inside `KnowledgeStore`),
                // so the only way `with_timeout` resolves to `Err` here is the
                // timeout branch.
                let infallible = async { Ok::<_, std::convert::Infallible>(knowledge.query(query, None, 5).await) };
                match tooling::async_utils::timeout::with_timeout(timeout, infallible).await {
                    Ok(entries) => entries,
                    Err(_) => {
                        tracing::warn!("knowledge query timed out, degrading to no context");
                        Vec::new()
                    }
                }
            };
            let _ = self_ref.send(WorkerMsg::KnowledgeReady { spec, reply_to, entries });
        });
    }

    fn handle_knowledge_ready(&mut self, spec: TaskSpec, _reply_to: OutcomeRef, entries: Vec<KnowledgeEntry>) {
        let prompt = assemble_prompt(&spec.description, &entries);
        self.runtime.send_prompt(prompt);
    }

    fn handle_graph_notice(&mut self, notice: GraphToWorkerMsg) {
        match notice {
            GraphToWorkerMsg::DecompositionAccepted { parent_id, child_ids } => {
                tracing::debug!(worker_id = %self.id, parent_id, ?child_ids, "decomposition accepted");
            }
            GraphToWorkerMsg::DecompositionRejected { parent_id, reason } => {
                tracing::warn!(worker_id = %self.id, parent_id, reason, "decomposition rejected");
            }
            GraphToWorkerMsg::SubtasksCompleted { parent_id, results } => {
                if self.active.contains_key(&parent_id) {
                    self.current_runtime_task = Some(parent_id.clone());
                    let prompt = assemble_synthesis_prompt(&parent_id, &results);
                    self.runtime.send_prompt(prompt);
                }
            }
        }
    }

    fn handle_runtime_complete(&mut self, task_id: String, summary: Option<String>, estimated_tokens: u64) {
        let Some(active) = self.active.remove(&task_id) else {
            return;
        };
        self.clear_runtime_if_current(&task_id);
        self.tasks.task_finished(task_id.clone(), estimated_tokens, false);

        if let Some(summary) = &summary {
            self.knowledge
                .store(summary.clone(), KnowledgeCategory::Outcome, HashMap::new());
            self.memory.store(format!("completed {task_id}"), summary.clone(), HashMap::new());
        }

        let _ = active.reply_to.send(TaskOutcome::Completed {
            task_id,
            summary,
            subplan: None,
            graph_id: active.graph_id,
            notice_ref: None,
        });
    }

    fn handle_runtime_failed(&mut self, task_id: String, reason: String, estimated_tokens: u64) {
        let Some(active) = self.active.remove(&task_id) else {
            return;
        };
        self.clear_runtime_if_current(&task_id);
        self.tasks.task_finished(task_id.clone(), estimated_tokens, false);

        self.knowledge
            .store(format!("{task_id}: {reason}"), KnowledgeCategory::Pitfall, HashMap::new());

        let _ = active.reply_to.send(TaskOutcome::Failed {
            task_id,
            reason,
            graph_id: active.graph_id,
        });
    }

    /// A decomposition proposal from the runtime. The task is not finished —
    /// it stays in `active` and keeps its own runtime slot idle until
    /// `TaskGraph` replies with an accept/reject via `GraphNotice`.
    fn handle_runtime_decompose(&mut self, task_id: String, json: String) {
        let Some(active) = self.active.get(&task_id) else {
            return;
        };
        let reply_to = active.reply_to.clone();
        let graph_id = active.graph_id.clone();

        match serde_json::from_str::<Subplan>(&json) {
            Ok(subplan) => {
                let notice_ref = forward_into(self.self_ref.clone(), WorkerMsg::GraphNotice);
                let _ = reply_to.send(TaskOutcome::Completed {
                    task_id,
                    summary: None,
                    subplan: Some(subplan),
                    graph_id,
                    notice_ref: Some(notice_ref),
                });
            }
            Err(err) => {
                tracing::warn!(worker_id = %self.id, task_id = %task_id, error = %err, "could not parse proposed decomposition");
                if let Some(active) = self.active.remove(&task_id) {
                    self.clear_runtime_if_current(&task_id);
                    self.tasks.task_finished(task_id.clone(), 0, false);
                    let _ = active.reply_to.send(TaskOutcome::Failed {
                        task_id,
                        reason: format!("invalid decomposition payload: {err}"),
                        graph_id: active.graph_id,
                    });
                }
            }
        }
    }

    fn handle_token_budget_exceeded(&mut self, task_id: String, estimated: u64, max: u64) {
        let Some(active) = self.active.remove(&task_id) else {
            return;
        };
        self.clear_runtime_if_current(&task_id);
        self.tasks.task_finished(task_id.clone(), estimated, true);

        let _ = active.reply_to.send(TaskOutcome::Failed {
            task_id,
            reason: format!("token budget exceeded: estimated {estimated} > max {max}"),
            graph_id: active.graph_id,
        });
    }

    fn handle_deadline_exceeded(&mut self, task_id: String) {
        let Some(active) = self.active.remove(&task_id) else {
            return;
        };
        if self.current_runtime_task.as_deref() == Some(task_id.as_str()) {
            self.runtime.cancel();
            self.current_runtime_task = None;
        }
        let _ = active.reply_to.send(TaskOutcome::Failed {
            task_id,
            reason: "task deadline exceeded".to_string(),
            graph_id: active.graph_id,
        });
    }

    fn handle_runtime_exited(&mut self, _exit_code: Option<i32>) {
        if matches!(self.config.runtime_kind, RuntimeKind::Demo) && self.active.is_empty() {
            self.runtime = WorkerRuntime::spawn(
                self.id.clone(),
                self.config.runtime_kind.clone(),
                self.self_ref.clone(),
                self.event_bus.clone(),
            );
        }
    }

    fn clear_runtime_if_current(&mut self, task_id: &str) {
        if self.current_runtime_task.as_deref() == Some(task_id) {
            self.runtime.clear_active_task();
            self.current_runtime_task = None;
        }
    }
}

fn assemble_prompt(description: &str, entries: &[KnowledgeEntry]) -> String {
    if entries.is_empty() {
        return description.to_string();
    }
    let mut prompt = String::from("relevant knowledge:\n");
    for entry in entries {
        let tags = if entry.tags.is_empty() {
            String::new()
        } else {
            let mut pairs: Vec<String> = entry.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            format!(" [{}]", pairs.join(", "))
        };
        prompt.push_str(&format!(
            "- ({:?}, relevance {:.2}){}: {}\n",
            entry.category, entry.relevance, tags, entry.content
        ));
    }
    prompt.push_str("\ntask:\n");
    prompt.push_str(description);
    prompt
}

fn assemble_synthesis_prompt(parent_id: &str, results: &[(String, TaskOutcome)]) -> String {
    let mut prompt = format!("synthesize results for {parent_id} from its subtasks:\n");
    for (child_id, outcome) in results {
        match outcome {
            TaskOutcome::Completed { summary, .. } => {
                prompt.push_str(&format!("- {child_id}: completed: {}\n", summary.as_deref().unwrap_or("")));
            }
            TaskOutcome::Failed { reason, .. } => {
                prompt.push_str(&format!("- {child_id}: failed: {reason}\n"));
            }
        }
    }
    prompt
}

/// Construct a fresh `OutcomeRef` that forwards into a worker's own mailbox
/// as a [`WorkerMsg::GraphNotice`]. Used by `TaskGraph` when it needs a
/// reply address to notify the proposing worker about decomposition
/// outcomes and eventual synthesis.
pub fn graph_notice_ref(worker: &WorkerHandle) -> ActorRef<GraphToWorkerMsg> {
    forward_into(worker.as_actor_ref(), WorkerMsg::GraphNotice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySidecar;
    use crate::skill_registry::SkillRegistry;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_bids_when_capable_and_above_threshold() {
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), EventBus::new());
        let sidecar = Arc::new(InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit", "shell"]),
            WorkerConfig::default(),
            dispatcher.clone(),
            registry,
            sidecar,
            EventBus::new(),
        );
        worker.task_available("t1", "do a thing", caps(&["edit"]), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_does_not_bid_below_threshold() {
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), EventBus::new());
        let sidecar = Arc::new(InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit"]),
            WorkerConfig::default(),
            dispatcher,
            registry,
            sidecar,
            EventBus::new(),
        );
        // only one of four required capabilities: fitness 0.25 < 0.5 threshold
        worker.task_available(
            "t1",
            "x",
            caps(&["edit", "shell", "fly", "swim"]),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_assemble_prompt_puts_knowledge_before_task_with_full_fields() {
        let entries = vec![KnowledgeEntry {
            content: "always check null pointers".to_string(),
            category: KnowledgeCategory::Pitfall,
            relevance: 0.87,
            tags: [("lang".to_string(), "rust".to_string())].into_iter().collect(),
            stored_at: chrono::Utc::now(),
        }];
        let prompt = assemble_prompt("fix the crash", &entries);

        let knowledge_pos = prompt.find("relevant knowledge:").unwrap();
        let task_pos = prompt.find("task:").unwrap();
        assert!(knowledge_pos < task_pos, "knowledge block must precede the task block");

        assert!(prompt.contains("Pitfall"));
        assert!(prompt.contains("0.87"));
        assert!(prompt.contains("lang=rust"));
        assert!(prompt.contains("always check null pointers"));
        assert!(prompt.contains("fix the crash"));
    }

    #[test]
    fn test_assemble_prompt_with_no_entries_is_bare_description() {
        assert_eq!(assemble_prompt("do the thing", &[]), "do the thing");
    }

    #[tokio::test]
    async fn test_task_assigned_then_demo_completes() {
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), EventBus::new());
        let sidecar = Arc::new(InMemorySidecar::new());
        let worker = Worker::spawn(
            "w1",
            caps(&["edit"]),
            WorkerConfig::default(),
            dispatcher,
            registry,
            sidecar,
            EventBus::new(),
        );

        let (reply, mut outcome_mailbox) = actor::mailbox();
        worker.task_assigned(TaskSpec::new("t1", "write some code"), reply);

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            TaskOutcome::Completed { task_id, .. } => assert_eq!(task_id, "t1"),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
