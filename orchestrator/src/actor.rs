//! Minimal actor runtime substrate.
//!
//! Rust has no built-in actor primitive, so every other module in this
//! crate is built on three small pieces defined here: a private mailbox, a
//! cloneable reference to it, and a helper that spawns an actor's message
//! loop as a `tokio` task. An actor is just "a type with a `handle(&mut
//! self, msg: M)` loop body" — there is no trait for it, because the loop
//! bodies differ enough (some need `&mut self`, some need shared state
//! behind a lock) that forcing a common trait would only get in the way.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The receiving half of an actor's mailbox.
///
/// Wraps an unbounded `mpsc` channel. Actors are not expected to be
/// backpressured by their mailbox; backpressure, where it matters (the
/// viewport's event queue, runtime output streaming), is applied explicitly
/// by the module that needs it rather than by blocking the sender here.
pub struct Mailbox<M> {
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M> Mailbox<M> {
    /// Receive the next message, or `None` once every [`ActorRef`] pointing
    /// at this mailbox has been dropped.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// A cloneable handle to an actor's mailbox.
///
/// This is the "reply address" referred to elsewhere in this crate: actors
/// never call each other's methods directly, they hold `ActorRef<M>`s and
/// send messages through them.
pub struct ActorRef<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef").finish_non_exhaustive()
    }
}

/// Error returned when a message could not be delivered because the
/// receiving actor's mailbox has already been dropped (the actor stopped).
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("actor mailbox closed")]
pub struct SendError;

impl<M> ActorRef<M> {
    /// Enqueue a message. Delivery is asynchronous; a successful return only
    /// means the message was placed in the mailbox, not that it has been
    /// processed.
    pub fn send(&self, msg: M) -> std::result::Result<(), SendError> {
        self.tx.send(msg).map_err(|_| SendError)
    }

    /// Number of `ActorRef`s (including this one) currently pointing at the
    /// mailbox. Used by actors that prune subscriber lists lazily.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Construct a fresh mailbox and its first handle.
pub fn mailbox<M>() -> (ActorRef<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ActorRef { tx }, Mailbox { rx })
}

/// A cooperative cancellation signal shared between an actor and a spawned
/// async operation (subprocess read loop, sidecar call, timer) it owns.
///
/// Deliberately hand-rolled rather than pulled in as a dependency: the need
/// is narrow (one flag, one wakeup) and every user of this type scopes a
/// fresh `CancelToken` to a single task or runtime rather than sharing one
/// crate-wide.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
    notify: std::sync::Arc<tokio::sync::Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called. Safe to
    /// `select!` against an in-progress operation.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge one actor's mailbox into another's.
///
/// Returns a fresh `ActorRef<M>` backed by a background task that receives
/// `M`s and re-sends them into `target` after applying `wrap`. This is the
/// "reply address" mechanism used wherever one actor needs to hand a
/// collaborator a place to send a reply shaped differently than the
/// collaborator's own mailbox — e.g. `TaskGraph` handing `Dispatcher` an
/// `OutcomeRef` that actually forwards into its own `GraphMsg` mailbox.
///
/// The bridge task exits (dropping its `ActorRef<M>`) once `target` is
/// closed, so a forwarding chain never outlives the actor it feeds.
pub fn forward_into<M, N>(target: ActorRef<N>, wrap: impl Fn(M) -> N + Send + 'static) -> ActorRef<M>
where
    M: Send + 'static,
    N: Send + 'static,
{
    let (bridge, mut mailbox) = mailbox::<M>();
    tokio::spawn(async move {
        while let Some(msg) = mailbox.recv().await {
            if target.send(wrap(msg)).is_err() {
                break;
            }
        }
    });
    bridge
}

/// Run an actor's message loop to completion on a dedicated `tokio` task.
///
/// `run` owns the actor's state and its [`Mailbox`]; it is expected to loop
/// on `mailbox.recv()` until it returns `None`, handling each message to
/// completion before receiving the next one (the "single-consumer,
/// processes-one-at-a-time" rule every actor in this crate follows).
pub fn spawn_actor<F, Fut>(run: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(run())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_recv() {
        let (tx, mut rx) = mailbox::<u32>();
        tx.send(42).unwrap();
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_clone_shares_mailbox() {
        let (tx, mut rx) = mailbox::<u32>();
        let tx2 = tx.clone();
        tx.send(1).unwrap();
        tx2.send(2).unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_recv_none_after_drop() {
        let (tx, mut rx) = mailbox::<u32>();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_mailbox_dropped_errors() {
        let (tx, rx) = mailbox::<u32>();
        drop(rx);
        assert!(tx.send(1).is_err());
    }

    #[tokio::test]
    async fn test_is_closed() {
        let (tx, rx) = mailbox::<u32>();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_token_cancel_then_check() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(100), task)
            .await
            .expect("cancellation should wake the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_actor_runs_loop() {
        let (tx, mut rx) = mailbox::<u32>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tx.send(7).unwrap();
        drop(tx);
        spawn_actor(move || async move {
            let mut total = 0u32;
            while let Some(msg) = rx.recv().await {
                total += msg;
            }
            done_tx.send(total).unwrap();
        });
        assert_eq!(done_rx.recv().await, Some(7));
    }
}
