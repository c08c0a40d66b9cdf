//! Concrete one-for-one supervisor for [`Worker`] actors.
//!
//! `SpawnWorker` is idempotent: asking to spawn a `worker_id` that is
//! already running just hands back its existing handle rather than
//! double-spawning. Every spawned worker is watched by a small background
//! task that waits on its `JoinHandle` and reports back as `WorkerExited`;
//! on that signal the supervisor consults [`RestartTracker`] and either
//! respawns the worker with its original capabilities/config or gives up
//! once the restart budget (default 3 restarts / 60s, see
//! [`RestartPolicy`]) is exhausted.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::actor::{self, ActorRef, Mailbox};
use crate::dispatcher::DispatcherHandle;
use crate::events::EventBus;
use crate::memory::sidecar::SidecarClient;
use crate::skill_registry::SkillRegistryHandle;
use crate::supervision::{RestartPolicy, RestartTracker};

use super::worker::{Worker, WorkerConfig, WorkerHandle};

/// Messages accepted by the [`WorkerSupervisor`] actor.
pub enum SupervisorMsg {
    /// Spawn a worker under supervision, or return the existing handle if
    /// `worker_id` is already running.
    SpawnWorker {
        worker_id: String,
        capabilities: HashSet<String>,
        config: WorkerConfig,
        reply: oneshot::Sender<WorkerHandle>,
    },
    /// Stop a supervised worker and forget it — no further restarts.
    StopWorker { worker_id: String },
    /// Internal: a supervised worker's actor loop exited.
    WorkerExited { worker_id: String },
}

/// Cloneable handle to a running [`WorkerSupervisor`] actor.
#[derive(Clone)]
pub struct WorkerSupervisorHandle {
    actor: ActorRef<SupervisorMsg>,
}

impl WorkerSupervisorHandle {
    pub async fn spawn_worker(
        &self,
        worker_id: impl Into<String>,
        capabilities: HashSet<String>,
        config: WorkerConfig,
    ) -> Option<WorkerHandle> {
        let (reply, rx) = oneshot::channel();
        if self
            .actor
            .send(SupervisorMsg::SpawnWorker {
                worker_id: worker_id.into(),
                capabilities,
                config,
                reply,
            })
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub fn stop_worker(&self, worker_id: impl Into<String>) {
        let _ = self.actor.send(SupervisorMsg::StopWorker {
            worker_id: worker_id.into(),
        });
    }
}

struct SupervisedChild {
    handle: WorkerHandle,
    capabilities: HashSet<String>,
    config: WorkerConfig,
    tracker: RestartTracker,
}

/// Owns every supervised worker's restart bookkeeping and re-registers a
/// respawned worker with the dispatcher in its predecessor's place.
pub struct WorkerSupervisor {
    dispatcher: DispatcherHandle,
    registry: SkillRegistryHandle,
    sidecar: Arc<dyn SidecarClient>,
    event_bus: EventBus,
    policy: RestartPolicy,
    children: HashMap<String, SupervisedChild>,
}

impl WorkerSupervisor {
    pub fn spawn(
        dispatcher: DispatcherHandle,
        registry: SkillRegistryHandle,
        sidecar: Arc<dyn SidecarClient>,
        event_bus: EventBus,
        policy: RestartPolicy,
    ) -> WorkerSupervisorHandle {
        let (actor, mailbox) = actor::mailbox();
        let supervisor = Self {
            dispatcher,
            registry,
            sidecar,
            event_bus,
            policy,
            children: HashMap::new(),
        };
        actor::spawn_actor(move || supervisor.run(mailbox, actor.clone()));
        WorkerSupervisorHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<SupervisorMsg>, self_ref: ActorRef<SupervisorMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                SupervisorMsg::SpawnWorker {
                    worker_id,
                    capabilities,
                    config,
                    reply,
                } => {
                    let handle = self.handle_spawn(worker_id, capabilities, config, &self_ref);
                    let _ = reply.send(handle);
                }
                SupervisorMsg::StopWorker { worker_id } => self.handle_stop(worker_id),
                SupervisorMsg::WorkerExited { worker_id } => {
                    self.handle_exited(worker_id, &self_ref);
                }
            }
        }
    }

    fn spawn_and_register(
        &mut self,
        worker_id: String,
        capabilities: HashSet<String>,
        config: WorkerConfig,
        self_ref: &ActorRef<SupervisorMsg>,
    ) -> WorkerHandle {
        let (handle, join) = Worker::spawn_supervised(
            worker_id.clone(),
            capabilities.clone(),
            config.clone(),
            self.dispatcher.clone(),
            self.registry.clone(),
            self.sidecar.clone(),
            self.event_bus.clone(),
        );
        self.dispatcher.register_worker(worker_id.clone(), handle.clone());

        let watcher_ref = self_ref.clone();
        let watched_id = worker_id.clone();
        tokio::spawn(async move {
            let _ = join.await;
            let _ = watcher_ref.send(SupervisorMsg::WorkerExited { worker_id: watched_id });
        });

        self.children.insert(
            worker_id,
            SupervisedChild {
                handle: handle.clone(),
                capabilities,
                config,
                tracker: RestartTracker::new(),
            },
        );
        handle
    }

    fn handle_spawn(
        &mut self,
        worker_id: String,
        capabilities: HashSet<String>,
        config: WorkerConfig,
        self_ref: &ActorRef<SupervisorMsg>,
    ) -> WorkerHandle {
        if let Some(existing) = self.children.get(&worker_id) {
            return existing.handle.clone();
        }
        self.spawn_and_register(worker_id, capabilities, config, self_ref)
    }

    fn handle_stop(&mut self, worker_id: String) {
        if let Some(child) = self.children.remove(&worker_id) {
            child.handle.stop();
            self.dispatcher.unregister_worker(worker_id);
        }
    }

    fn handle_exited(&mut self, worker_id: String, self_ref: &ActorRef<SupervisorMsg>) {
        let Some(mut child) = self.children.remove(&worker_id) else {
            // already stopped deliberately via StopWorker; nothing to do
            return;
        };

        if child.tracker.record_restart(&self.policy, Instant::now()) {
            tracing::warn!(worker_id = %worker_id, restarts = child.tracker.count(), "worker crashed, restarting");
            self.dispatcher.unregister_worker(worker_id.clone());
            let capabilities = child.capabilities.clone();
            let config = child.config.clone();
            let tracker = std::mem::take(&mut child.tracker);
            let handle = self.spawn_and_register(worker_id.clone(), capabilities, config, self_ref);
            if let Some(reinserted) = self.children.get_mut(&worker_id) {
                reinserted.tracker = tracker;
                reinserted.handle = handle;
            }
        } else {
            tracing::error!(worker_id = %worker_id, "worker exceeded restart budget, giving up");
            self.dispatcher.unregister_worker(worker_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySidecar;
    use crate::skill_registry::SkillRegistry;
    use std::time::Duration;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_spawn_worker_is_idempotent() {
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), EventBus::new());
        let sidecar = Arc::new(InMemorySidecar::new());
        let supervisor =
            WorkerSupervisor::spawn(dispatcher, registry, sidecar, EventBus::new(), RestartPolicy::default());

        let h1 = supervisor
            .spawn_worker("w1", caps(&["edit"]), WorkerConfig::default())
            .await
            .unwrap();
        let h2 = supervisor
            .spawn_worker("w1", caps(&["edit"]), WorkerConfig::default())
            .await
            .unwrap();
        h1.task_available("probe", "x", caps(&[]), Duration::from_millis(10));
        h2.task_available("probe", "x", caps(&[]), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_stop_worker_prevents_restart() {
        let registry = SkillRegistry::spawn();
        let dispatcher =
            crate::dispatcher::Dispatcher::spawn(registry.clone(), Duration::from_millis(50), EventBus::new());
        let sidecar = Arc::new(InMemorySidecar::new());
        let supervisor =
            WorkerSupervisor::spawn(dispatcher, registry, sidecar, EventBus::new(), RestartPolicy::default());

        let handle = supervisor
            .spawn_worker("w1", caps(&["edit"]), WorkerConfig::default())
            .await
            .unwrap();
        supervisor.stop_worker("w1");
        handle.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a fresh spawn after stop produces a new worker, not a restart echo
        let handle2 = supervisor
            .spawn_worker("w1", caps(&["edit"]), WorkerConfig::default())
            .await
            .unwrap();
        handle2.task_available("probe", "x", caps(&[]), Duration::from_millis(10));
    }
}
