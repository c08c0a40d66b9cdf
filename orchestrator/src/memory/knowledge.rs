//! Per-worker long-term semantic knowledge store.
//!
//! Unlike [`MemoryStore`](super::store::MemoryStore), knowledge writes are
//! not debounced — each store call is a direct sidecar call, since
//! knowledge entries are written once per task outcome rather than
//! streamed incrementally. The failure-handling rule is identical: search
//! degrades to empty, store failures are logged and dropped.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::actor::{self, ActorRef, Mailbox};

use super::sidecar::SidecarClient;
use super::{KnowledgeCategory, KnowledgeEntry};

/// Messages accepted by a [`KnowledgeStore`] actor.
#[derive(Debug)]
pub enum KnowledgeMsg {
    Store {
        content: String,
        category: KnowledgeCategory,
        tags: std::collections::HashMap<String, String>,
    },
    Query {
        query: String,
        category: Option<KnowledgeCategory>,
        top_k: usize,
        reply: oneshot::Sender<Vec<KnowledgeEntry>>,
    },
}

/// Cloneable handle to a running [`KnowledgeStore`] actor.
#[derive(Clone)]
pub struct KnowledgeHandle {
    actor: ActorRef<KnowledgeMsg>,
}

impl KnowledgeHandle {
    pub fn store(
        &self,
        content: impl Into<String>,
        category: KnowledgeCategory,
        tags: std::collections::HashMap<String, String>,
    ) {
        let _ = self.actor.send(KnowledgeMsg::Store {
            content: content.into(),
            category,
            tags,
        });
    }

    pub async fn query(
        &self,
        query: impl Into<String>,
        category: Option<KnowledgeCategory>,
        top_k: usize,
    ) -> Vec<KnowledgeEntry> {
        let (reply, rx) = oneshot::channel();
        if self
            .actor
            .send(KnowledgeMsg::Query {
                query: query.into(),
                category,
                top_k,
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Semantic store for a single worker, delegating to a [`SidecarClient`].
pub struct KnowledgeStore {
    worker_id: String,
    sidecar: Arc<dyn SidecarClient>,
}

impl KnowledgeStore {
    pub fn spawn(worker_id: impl Into<String>, sidecar: Arc<dyn SidecarClient>) -> KnowledgeHandle {
        let (actor, mailbox) = actor::mailbox();
        let store = Self {
            worker_id: worker_id.into(),
            sidecar,
        };
        actor::spawn_actor(move || store.run(mailbox));
        KnowledgeHandle { actor }
    }

    async fn run(self, mut mailbox: Mailbox<KnowledgeMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                KnowledgeMsg::Store {
                    content,
                    category,
                    tags,
                } => {
                    if let Err(err) = self
                        .sidecar
                        .store_knowledge(&self.worker_id, &content, category, tags)
                        .await
                    {
                        tracing::warn!(worker_id = %self.worker_id, error = %err, "knowledge store failed, dropping");
                    }
                }
                KnowledgeMsg::Query {
                    query,
                    category,
                    top_k,
                    reply,
                } => {
                    let hits = match self
                        .sidecar
                        .search_knowledge(&self.worker_id, &query, category, top_k)
                        .await
                    {
                        Ok(hits) => hits,
                        Err(err) => {
                            tracing::warn!(worker_id = %self.worker_id, error = %err, "knowledge search failed, degrading to empty");
                            Vec::new()
                        }
                    };
                    let _ = reply.send(hits);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySidecar;

    #[tokio::test]
    async fn test_store_then_query() {
        let sidecar = Arc::new(InMemorySidecar::new());
        let handle = KnowledgeStore::spawn("w1", sidecar);
        handle.store("always check null pointers", KnowledgeCategory::Pitfall, Default::default());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let hits = handle.query("null pointers", None, 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, KnowledgeCategory::Pitfall);
    }

    #[tokio::test]
    async fn test_query_filters_by_category() {
        let sidecar = Arc::new(InMemorySidecar::new());
        let handle = KnowledgeStore::spawn("w1", sidecar);
        handle.store("use batching", KnowledgeCategory::Pattern, Default::default());
        handle.store("forgot to close file handle", KnowledgeCategory::Pitfall, Default::default());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let hits = handle.query("", Some(KnowledgeCategory::Pattern), 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, KnowledgeCategory::Pattern);
    }

    #[tokio::test]
    async fn test_query_with_no_entries_is_empty() {
        let sidecar = Arc::new(InMemorySidecar::new());
        let handle = KnowledgeStore::spawn("w1", sidecar);
        assert!(handle.query("anything", None, 5).await.is_empty());
    }
}
