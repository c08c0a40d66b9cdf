//! Capability registry: which workers can do what.
//!
//! A thin actor wrapping a `dashmap`. Kept as an actor (rather than a bare
//! shared map passed around by `Arc`) so its two call sites — `Dispatcher`
//! querying capable workers, `Worker` registering/unregistering on
//! start/stop — go through the same ordered message path as every other
//! actor in the tree, and so a future remote-registry swap only touches
//! this file.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::actor::{self, ActorRef, Mailbox};

/// Messages accepted by the [`SkillRegistry`] actor.
#[derive(Debug)]
pub enum SkillRegistryMsg {
    Register {
        worker_id: String,
        capabilities: HashSet<String>,
    },
    Unregister {
        worker_id: String,
    },
    QueryCapable {
        required: HashSet<String>,
        reply: tokio::sync::oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to a running [`SkillRegistry`] actor.
#[derive(Clone)]
pub struct SkillRegistryHandle {
    actor: ActorRef<SkillRegistryMsg>,
}

impl SkillRegistryHandle {
    pub fn register(&self, worker_id: impl Into<String>, capabilities: HashSet<String>) {
        let _ = self.actor.send(SkillRegistryMsg::Register {
            worker_id: worker_id.into(),
            capabilities,
        });
    }

    pub fn unregister(&self, worker_id: impl Into<String>) {
        let _ = self.actor.send(SkillRegistryMsg::Unregister {
            worker_id: worker_id.into(),
        });
    }

    /// Returns the ids of workers whose capability set is a superset of
    /// `required`, in registry snapshot iteration order. That order is
    /// intentionally unspecified beyond "stable within one snapshot" —
    /// callers needing a deterministic fallback pick should not depend on
    /// a particular worker ending up first.
    pub async fn query_capable(&self, required: HashSet<String>) -> Vec<String> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .actor
            .send(SkillRegistryMsg::QueryCapable { required, reply })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Maps worker-id to capability set and answers capability-superset queries.
pub struct SkillRegistry {
    capabilities: Arc<DashMap<String, HashSet<String>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the registry actor and return a handle to it.
    pub fn spawn() -> SkillRegistryHandle {
        let (actor, mailbox) = actor::mailbox();
        let registry = Self::new();
        actor::spawn_actor(move || registry.run(mailbox));
        SkillRegistryHandle { actor }
    }

    async fn run(self, mut mailbox: Mailbox<SkillRegistryMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                SkillRegistryMsg::Register {
                    worker_id,
                    capabilities,
                } => {
                    self.capabilities.insert(worker_id, capabilities);
                }
                SkillRegistryMsg::Unregister { worker_id } => {
                    self.capabilities.remove(&worker_id);
                }
                SkillRegistryMsg::QueryCapable { required, reply } => {
                    let matches = self.query_capable(&required);
                    let _ = reply.send(matches);
                }
            }
        }
    }

    fn query_capable(&self, required: &HashSet<String>) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|entry| required.is_subset(entry.value()))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_and_query_capable() {
        let handle = SkillRegistry::spawn();
        handle.register("w1", caps(&["edit", "shell"]));
        handle.register("w2", caps(&["edit"]));

        let matches = handle.query_capable(caps(&["edit"])).await;
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(&"w1".to_string()));
        assert!(matches.contains(&"w2".to_string()));
    }

    #[tokio::test]
    async fn test_query_requires_superset() {
        let handle = SkillRegistry::spawn();
        handle.register("w1", caps(&["edit"]));

        let matches = handle.query_capable(caps(&["edit", "shell"])).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_removes_worker() {
        let handle = SkillRegistry::spawn();
        handle.register("w1", caps(&["edit"]));
        handle.unregister("w1");

        let matches = handle.query_capable(caps(&["edit"])).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_worker_is_noop() {
        let handle = SkillRegistry::spawn();
        handle.unregister("ghost");
        let matches = handle.query_capable(HashSet::new()).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_re_register_replaces_capabilities() {
        let handle = SkillRegistry::spawn();
        handle.register("w1", caps(&["edit"]));
        handle.register("w1", caps(&["shell"]));

        assert!(handle.query_capable(caps(&["edit"])).await.is_empty());
        assert_eq!(handle.query_capable(caps(&["shell"])).await, vec!["w1".to_string()]);
    }
}
