//! Four-layer memory coordinator: episodic store, semantic knowledge store,
//! the [`blackboard`](crate::blackboard) pub/sub layer, and per-agent
//! scratch (the working-memory map carried on `Worker` itself).
//!
//! This module covers the two sidecar-backed layers: [`store`] (episodic,
//! "what happened") and [`knowledge`] (semantic, "what we learned"). Both
//! delegate to a [`SidecarClient`](sidecar::SidecarClient) and apply the
//! same graceful-degradation rule: a failed search returns empty, a failed
//! store is logged and dropped, nothing propagates as a task-level error.

pub mod knowledge;
pub mod sidecar;
pub mod store;

pub use knowledge::{KnowledgeHandle, KnowledgeStore};
pub use sidecar::{InMemorySidecar, SidecarClient};
pub use store::{MemoryHandle, MemoryStore};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category tag for a [`KnowledgeEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Outcome,
    Pitfall,
    Pattern,
    Codebase,
    Preference,
}

/// One item retrieved from (or stored to) the semantic knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub content: String,
    pub category: KnowledgeCategory,
    pub relevance: f64,
    pub tags: HashMap<String, String>,
    pub stored_at: chrono::DateTime<chrono::Utc>,
}

/// One item retrieved from the episodic memory store. Episodic entries have
/// no category or relevance score — they are a flat append/search log of
/// titled notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub title: String,
    pub content: String,
    pub tags: HashMap<String, String>,
    pub stored_at: chrono::DateTime<chrono::Utc>,
}
