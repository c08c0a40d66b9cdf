//! Per-worker episodic memory store.
//!
//! Appends and searches go straight to the sidecar; commits are coalesced —
//! a successful store schedules a debounced commit rather than committing
//! immediately, and a commit already in flight suppresses scheduling a new
//! one until it returns. This matches the behavior the worker above it
//! relies on: it fires-and-forgets writes and never waits on a commit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::actor::{self, ActorRef, Mailbox};

use super::sidecar::SidecarClient;
use super::MemoryEntry;

/// Messages accepted by a [`MemoryStore`] actor.
#[derive(Debug)]
pub enum MemoryMsg {
    Store {
        title: String,
        content: String,
        tags: std::collections::HashMap<String, String>,
    },
    Search {
        query: String,
        top_k: usize,
        reply: oneshot::Sender<Vec<MemoryEntry>>,
    },
    Commit,
    /// Internal: the debounce timer fired.
    DebounceFired,
    /// Internal: an in-flight commit completed.
    CommitCompleted,
}

/// Cloneable handle to a running [`MemoryStore`] actor.
#[derive(Clone)]
pub struct MemoryHandle {
    actor: ActorRef<MemoryMsg>,
}

impl MemoryHandle {
    pub fn store(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        tags: std::collections::HashMap<String, String>,
    ) {
        let _ = self.actor.send(MemoryMsg::Store {
            title: title.into(),
            content: content.into(),
            tags,
        });
    }

    pub async fn search(&self, query: impl Into<String>, top_k: usize) -> Vec<MemoryEntry> {
        let (reply, rx) = oneshot::channel();
        if self
            .actor
            .send(MemoryMsg::Search {
                query: query.into(),
                top_k,
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn commit(&self) {
        let _ = self.actor.send(MemoryMsg::Commit);
    }
}

/// Episodic store for a single worker, delegating to a [`SidecarClient`].
pub struct MemoryStore {
    worker_id: String,
    sidecar: Arc<dyn SidecarClient>,
    debounce: Duration,
    commit_in_flight: bool,
    commit_pending: bool,
    self_ref: Option<ActorRef<MemoryMsg>>,
}

impl MemoryStore {
    pub fn spawn(
        worker_id: impl Into<String>,
        sidecar: Arc<dyn SidecarClient>,
        debounce: Duration,
    ) -> MemoryHandle {
        let (actor, mailbox) = actor::mailbox();
        let store = Self {
            worker_id: worker_id.into(),
            sidecar,
            debounce,
            commit_in_flight: false,
            commit_pending: false,
            self_ref: Some(actor.clone()),
        };
        actor::spawn_actor(move || store.run(mailbox));
        MemoryHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<MemoryMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                MemoryMsg::Store {
                    title,
                    content,
                    tags,
                } => self.handle_store(title, content, tags).await,
                MemoryMsg::Search { query, top_k, reply } => {
                    let hits = self.handle_search(query, top_k).await;
                    let _ = reply.send(hits);
                }
                MemoryMsg::Commit => self.schedule_commit(),
                MemoryMsg::DebounceFired => self.fire_commit(),
                MemoryMsg::CommitCompleted => {
                    self.commit_in_flight = false;
                    if self.commit_pending {
                        self.commit_pending = false;
                        self.schedule_commit();
                    }
                }
            }
        }
    }

    async fn handle_store(
        &mut self,
        title: String,
        content: String,
        tags: std::collections::HashMap<String, String>,
    ) {
        match self
            .sidecar
            .store_memory(&self.worker_id, &title, &content, tags)
            .await
        {
            Ok(()) => self.schedule_commit(),
            Err(err) => tracing::warn!(worker_id = %self.worker_id, error = %err, "memory store failed, dropping"),
        }
    }

    async fn handle_search(&self, query: String, top_k: usize) -> Vec<MemoryEntry> {
        match self.sidecar.search_memory(&self.worker_id, &query, top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(worker_id = %self.worker_id, error = %err, "memory search failed, degrading to empty");
                Vec::new()
            }
        }
    }

    fn schedule_commit(&mut self) {
        if self.commit_in_flight {
            self.commit_pending = true;
            return;
        }
        let Some(self_ref) = self.self_ref.clone() else {
            return;
        };
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = self_ref.send(MemoryMsg::DebounceFired);
        });
    }

    fn fire_commit(&mut self) {
        if self.commit_in_flight {
            self.commit_pending = true;
            return;
        }
        self.commit_in_flight = true;
        let sidecar = self.sidecar.clone();
        let worker_id = self.worker_id.clone();
        let Some(self_ref) = self.self_ref.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = sidecar.commit_memory(&worker_id).await {
                tracing::warn!(worker_id = %worker_id, error = %err, "memory commit failed");
            }
            let _ = self_ref.send(MemoryMsg::CommitCompleted);
        });
    }
}
