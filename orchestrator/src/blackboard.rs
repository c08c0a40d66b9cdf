//! Cross-agent pub/sub key-value store.
//!
//! The blackboard is one of the few legitimate shared-mutable surfaces in
//! this crate (the others are the event bus and the viewport's queue); it
//! serializes its own mutations by being, like everything else, a
//! single-consumer actor over its mailbox. Per-key publication order is
//! preserved for subscribers of that key; no ordering is promised across
//! different keys.

use std::collections::HashMap;

use crate::actor::{self, ActorRef, Mailbox};

/// A published value, with the publisher that last wrote it (if any).
#[derive(Debug, Clone)]
pub struct Signal {
    pub value: String,
    pub publisher_id: Option<String>,
}

/// Delivered to a subscriber when the value at a key it watches changes,
/// and once immediately on subscribe if the key already has a value.
#[derive(Debug, Clone)]
pub struct SignalValue {
    pub key: String,
    pub signal: Signal,
}

/// Messages accepted by the [`Blackboard`] actor.
#[derive(Debug)]
pub enum BlackboardMsg {
    Publish {
        key: String,
        value: String,
        publisher_id: Option<String>,
    },
    Query {
        key: String,
        reply: tokio::sync::oneshot::Sender<Option<Signal>>,
    },
    Subscribe {
        key: String,
        subscriber: ActorRef<SignalValue>,
    },
    List {
        prefix: Option<String>,
        reply: tokio::sync::oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to a running [`Blackboard`] actor.
#[derive(Clone)]
pub struct BlackboardHandle {
    actor: ActorRef<BlackboardMsg>,
}

impl BlackboardHandle {
    pub fn publish(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        publisher_id: Option<String>,
    ) {
        let _ = self.actor.send(BlackboardMsg::Publish {
            key: key.into(),
            value: value.into(),
            publisher_id,
        });
    }

    pub async fn query(&self, key: impl Into<String>) -> Option<Signal> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .actor
            .send(BlackboardMsg::Query {
                key: key.into(),
                reply,
            })
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Subscribe `subscriber` to updates at `key`. The current value, if
    /// any, is delivered immediately as the first [`SignalValue`].
    pub fn subscribe(&self, key: impl Into<String>, subscriber: ActorRef<SignalValue>) {
        let _ = self.actor.send(BlackboardMsg::Subscribe {
            key: key.into(),
            subscriber,
        });
    }

    pub async fn list(&self, prefix: Option<String>) -> Vec<String> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.actor.send(BlackboardMsg::List { prefix, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Key→(value, publisher) store with per-key subscriber sets.
pub struct Blackboard {
    values: HashMap<String, Signal>,
    subscribers: HashMap<String, Vec<ActorRef<SignalValue>>>,
    event_bus: crate::events::EventBus,
}

impl Blackboard {
    pub fn new(event_bus: crate::events::EventBus) -> Self {
        Self {
            values: HashMap::new(),
            subscribers: HashMap::new(),
            event_bus,
        }
    }

    pub fn spawn(event_bus: crate::events::EventBus) -> BlackboardHandle {
        let (actor, mailbox) = actor::mailbox();
        let blackboard = Self::new(event_bus);
        actor::spawn_actor(move || blackboard.run(mailbox));
        BlackboardHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<BlackboardMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                BlackboardMsg::Publish {
                    key,
                    value,
                    publisher_id,
                } => self.handle_publish(key, value, publisher_id),
                BlackboardMsg::Query { key, reply } => {
                    let _ = reply.send(self.values.get(&key).cloned());
                }
                BlackboardMsg::Subscribe { key, subscriber } => {
                    self.handle_subscribe(key, subscriber);
                }
                BlackboardMsg::List { prefix, reply } => {
                    let keys = self.handle_list(prefix);
                    let _ = reply.send(keys);
                }
            }
        }
    }

    fn handle_publish(&mut self, key: String, value: String, publisher_id: Option<String>) {
        let signal = Signal {
            value,
            publisher_id: publisher_id.clone(),
        };
        self.values.insert(key.clone(), signal.clone());

        if let Some(subs) = self.subscribers.get_mut(&key) {
            subs.retain(|sub| {
                sub.send(SignalValue {
                    key: key.clone(),
                    signal: signal.clone(),
                })
                .is_ok()
            });
        }

        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::node_status_changed(
                "blackboard",
                &key,
                "published",
            ));
    }

    fn handle_subscribe(&mut self, key: String, subscriber: ActorRef<SignalValue>) {
        if let Some(current) = self.values.get(&key) {
            let _ = subscriber.send(SignalValue {
                key: key.clone(),
                signal: current.clone(),
            });
        }
        self.subscribers.entry(key).or_default().push(subscriber);
    }

    fn handle_list(&self, prefix: Option<String>) -> Vec<String> {
        self.values
            .keys()
            .filter(|k| prefix.as_ref().map(|p| k.starts_with(p.as_str())).unwrap_or(true))
            .cloned()
            .collect()
    }
}
