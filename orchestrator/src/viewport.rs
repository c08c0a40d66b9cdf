//! Thin bridge from the event bus to an external renderer.
//!
//! `Viewport` never originates commands and holds no state of its own
//! beyond the list of registered sinks — it exists only because an
//! external renderer drains events from a plain OS thread, not an async
//! task, so something has to sit between [`EventBus`]'s broadcast channel
//! and a [`std::sync::mpsc`] queue a foreign thread can block on.
//!
//! Registering a sink hands back the receiving half of a bounded
//! `sync_channel`; the caller drains it however it likes (typically a
//! dedicated render thread). A full queue means the consumer fell behind —
//! the event is dropped rather than the publish blocking, per the event
//! bus's own "must never block on a subscriber" rule.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::actor::{self, ActorRef, Mailbox};
use crate::events::{EventBus, ViewportEvent};

const DEFAULT_SINK_CAPACITY: usize = 256;

/// Messages accepted by the [`Viewport`] actor.
pub enum ViewportMsg {
    RegisterSink {
        capacity: usize,
        reply: tokio::sync::oneshot::Sender<Receiver<ViewportEvent>>,
    },
    /// Internal: an event arrived from the bus's broadcast channel.
    Broadcast(ViewportEvent),
}

/// Cloneable handle to a running [`Viewport`] actor.
#[derive(Clone)]
pub struct ViewportHandle {
    actor: ActorRef<ViewportMsg>,
}

impl ViewportHandle {
    /// Register a new external sink and return the consuming end of its
    /// queue. Uses [`DEFAULT_SINK_CAPACITY`] as the queue's bound.
    pub async fn register_sink(&self) -> Option<Receiver<ViewportEvent>> {
        self.register_sink_with_capacity(DEFAULT_SINK_CAPACITY).await
    }

    pub async fn register_sink_with_capacity(&self, capacity: usize) -> Option<Receiver<ViewportEvent>> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .actor
            .send(ViewportMsg::RegisterSink { capacity, reply })
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }
}

/// Owns every registered sink and the subscription to the bus's viewport
/// broadcast channel.
pub struct Viewport {
    sinks: Vec<SyncSender<ViewportEvent>>,
}

impl Viewport {
    /// Spawn the bridge: one task drains registration requests and pushes
    /// events into every live sink, a second task owns the broadcast
    /// subscription and forwards each event in as it arrives.
    pub fn spawn(event_bus: EventBus) -> ViewportHandle {
        let (actor, mailbox) = actor::mailbox();
        let viewport = Self { sinks: Vec::new() };

        let forward_ref = actor.clone();
        tokio::spawn(async move {
            let mut rx = event_bus.subscribe_viewport();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if forward_ref.send(ViewportMsg::Broadcast(event)).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        actor::spawn_actor(move || viewport.run(mailbox));
        ViewportHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<ViewportMsg>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                ViewportMsg::RegisterSink { capacity, reply } => {
                    let (tx, rx) = sync_channel(capacity.max(1));
                    self.sinks.push(tx);
                    let _ = reply.send(rx);
                }
                ViewportMsg::Broadcast(event) => self.fanout(event),
            }
        }
    }

    fn fanout(&mut self, event: ViewportEvent) {
        self.sinks.retain(|sink| match sink.try_send(event.clone()) {
            Ok(()) => true,
            Err(std::sync::mpsc::TrySendError::Full(_)) => {
                tracing::warn!("viewport sink queue full, dropping event");
                true
            }
            Err(std::sync::mpsc::TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_registered_sink_receives_published_event() {
        let bus = EventBus::new();
        let viewport = Viewport::spawn(bus.clone());
        let rx = viewport.register_sink().await.unwrap();

        bus.publish_viewport(ViewportEvent::worker_spawned("w1", vec!["edit".to_string()]));

        let event = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        match event {
            ViewportEvent::WorkerSpawned { worker_id, .. } => assert_eq!(worker_id, "w1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_sinks_each_receive_every_event() {
        let bus = EventBus::new();
        let viewport = Viewport::spawn(bus.clone());
        let rx1 = viewport.register_sink().await.unwrap();
        let rx2 = viewport.register_sink().await.unwrap();

        bus.publish_viewport(ViewportEvent::worker_despawned("w1"));

        for rx in [rx1, rx2] {
            let event = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event, ViewportEvent::WorkerDespawned { .. }));
        }
    }

    #[tokio::test]
    async fn test_dropped_sink_is_pruned_without_panicking() {
        let bus = EventBus::new();
        let viewport = Viewport::spawn(bus.clone());
        let rx = viewport.register_sink().await.unwrap();
        drop(rx);

        bus.publish_viewport(ViewportEvent::worker_despawned("w1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a fresh sink registered afterward still works, proving the actor
        // loop survived the disconnected sink without panicking
        let rx2 = viewport.register_sink().await.unwrap();
        bus.publish_viewport(ViewportEvent::worker_despawned("w2"));
        let event = tokio::task::spawn_blocking(move || rx2.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ViewportEvent::WorkerDespawned { .. }));
    }
}
