//! The external collaborator interface for episodic/semantic storage.
//!
//! `SidecarClient` is the protocol-level boundary named in the external
//! interfaces: an opaque service (in production, a separate CLI/process)
//! that actually indexes and retrieves memory and knowledge. The core only
//! ever depends on this trait, never on a concrete storage engine — its
//! internal indexing pipeline is explicitly out of scope here.
//!
//! [`InMemorySidecar`] is the one production-shaped implementation this
//! crate ships: a process-local store good enough to run the orchestrator
//! standalone and to drive tests, with no external process required.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{KnowledgeCategory, KnowledgeEntry, MemoryEntry};

/// Errors a sidecar operation can fail with. The caller (MemoryStore /
/// KnowledgeStore) treats every variant identically: log and degrade
/// gracefully, never propagate as a task failure.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("sidecar operation timed out")]
    Timeout,
    #[error("sidecar operation failed: {0}")]
    Failed(String),
}

/// Bounded-timeout storage/retrieval collaborator for both memory layers.
#[async_trait]
pub trait SidecarClient: Send + Sync {
    async fn store_knowledge(
        &self,
        worker_id: &str,
        content: &str,
        category: KnowledgeCategory,
        tags: HashMap<String, String>,
    ) -> std::result::Result<(), SidecarError>;

    async fn search_knowledge(
        &self,
        worker_id: &str,
        query: &str,
        category: Option<KnowledgeCategory>,
        top_k: usize,
    ) -> std::result::Result<Vec<KnowledgeEntry>, SidecarError>;

    async fn store_memory(
        &self,
        worker_id: &str,
        title: &str,
        content: &str,
        tags: HashMap<String, String>,
    ) -> std::result::Result<(), SidecarError>;

    async fn search_memory(
        &self,
        worker_id: &str,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<MemoryEntry>, SidecarError>;

    async fn commit_memory(&self, worker_id: &str) -> std::result::Result<(), SidecarError>;
}

#[derive(Default)]
struct WorkerStore {
    memory: Vec<MemoryEntry>,
    knowledge: Vec<KnowledgeEntry>,
}

/// In-process sidecar: stores everything in memory, keyed by worker id.
/// Relevance is a crude substring-match score — good enough to exercise
/// ranking behavior in tests without depending on an embeddings backend.
pub struct InMemorySidecar {
    workers: Arc<Mutex<HashMap<String, WorkerStore>>>,
}

impl InMemorySidecar {
    pub fn new() -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn relevance(query: &str, content: &str) -> f64 {
        if query.is_empty() {
            return 0.5;
        }
        let query_lower = query.to_lowercase();
        let content_lower = content.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        if query_words.is_empty() {
            return 0.5;
        }
        let hits = query_words
            .iter()
            .filter(|w| content_lower.contains(*w))
            .count();
        hits as f64 / query_words.len() as f64
    }
}

impl Default for InMemorySidecar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SidecarClient for InMemorySidecar {
    async fn store_knowledge(
        &self,
        worker_id: &str,
        content: &str,
        category: KnowledgeCategory,
        tags: HashMap<String, String>,
    ) -> std::result::Result<(), SidecarError> {
        let mut workers = self.workers.lock();
        workers
            .entry(worker_id.to_string())
            .or_default()
            .knowledge
            .push(KnowledgeEntry {
                content: content.to_string(),
                category,
                relevance: 1.0,
                tags,
                stored_at: Utc::now(),
            });
        Ok(())
    }

    async fn search_knowledge(
        &self,
        worker_id: &str,
        query: &str,
        category: Option<KnowledgeCategory>,
        top_k: usize,
    ) -> std::result::Result<Vec<KnowledgeEntry>, SidecarError> {
        let workers = self.workers.lock();
        let Some(store) = workers.get(worker_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<KnowledgeEntry> = store
            .knowledge
            .iter()
            .filter(|entry| category.map(|c| c == entry.category).unwrap_or(true))
            .map(|entry| {
                let mut entry = entry.clone();
                entry.relevance = Self::relevance(query, &entry.content);
                entry
            })
            .collect();
        scored.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap());
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn store_memory(
        &self,
        worker_id: &str,
        title: &str,
        content: &str,
        tags: HashMap<String, String>,
    ) -> std::result::Result<(), SidecarError> {
        let mut workers = self.workers.lock();
        workers
            .entry(worker_id.to_string())
            .or_default()
            .memory
            .push(MemoryEntry {
                title: title.to_string(),
                content: content.to_string(),
                tags,
                stored_at: Utc::now(),
            });
        Ok(())
    }

    async fn search_memory(
        &self,
        worker_id: &str,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<MemoryEntry>, SidecarError> {
        let workers = self.workers.lock();
        let Some(store) = workers.get(worker_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(f64, MemoryEntry)> = store
            .memory
            .iter()
            .map(|entry| (Self::relevance(query, &entry.content), entry.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        Ok(scored.into_iter().take(top_k).map(|(_, e)| e).collect())
    }

    async fn commit_memory(&self, _worker_id: &str) -> std::result::Result<(), SidecarError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_search_knowledge() {
        let sidecar = InMemorySidecar::new();
        sidecar
            .store_knowledge("w1", "always run tests before merging", KnowledgeCategory::Pattern, HashMap::new())
            .await
            .unwrap();

        let hits = sidecar
            .search_knowledge("w1", "run tests", None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, KnowledgeCategory::Pattern);
    }

    #[tokio::test]
    async fn test_search_knowledge_unknown_worker_returns_empty() {
        let sidecar = InMemorySidecar::new();
        let hits = sidecar.search_knowledge("ghost", "anything", None, 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_knowledge_filters_by_category() {
        let sidecar = InMemorySidecar::new();
        sidecar
            .store_knowledge("w1", "off by one in loop", KnowledgeCategory::Pitfall, HashMap::new())
            .await
            .unwrap();
        sidecar
            .store_knowledge("w1", "good batching pattern", KnowledgeCategory::Pattern, HashMap::new())
            .await
            .unwrap();

        let hits = sidecar
            .search_knowledge("w1", "", Some(KnowledgeCategory::Pitfall), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, KnowledgeCategory::Pitfall);
    }

    #[tokio::test]
    async fn test_store_and_search_memory_ranks_by_relevance() {
        let sidecar = InMemorySidecar::new();
        sidecar
            .store_memory("w1", "unrelated", "painted the fence", HashMap::new())
            .await
            .unwrap();
        sidecar
            .store_memory("w1", "relevant", "refactored the auth module", HashMap::new())
            .await
            .unwrap();

        let hits = sidecar.search_memory("w1", "refactor auth", 5).await.unwrap();
        assert_eq!(hits[0].title, "relevant");
    }

    #[tokio::test]
    async fn test_commit_memory_is_a_noop_in_memory() {
        let sidecar = InMemorySidecar::new();
        assert!(sidecar.commit_memory("w1").await.is_ok());
    }
}
