//! Restart-on-failure supervision for actor-owned children.
//!
//! [`WorkerSupervisor`](crate::worker::supervisor::WorkerSupervisor) is the
//! one concrete user of this module today, but the policy and bookkeeping
//! are generic over the child's message type so any future supervising
//! actor can reuse them.
//!
//! This tracks restart counts in a sliding time window rather than
//! computing a backoff delay: the rule this crate implements is "at most N
//! restarts per window, then give up," not "wait progressively longer
//! between attempts."

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded-retry restart policy: a child may be restarted at most
/// `max_restarts` times within a sliding `window`. The count resets as old
/// restarts age out of the window, not on a fixed timer.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
        }
    }
}

/// Per-child restart bookkeeping for one [`RestartPolicy`].
///
/// Kept separate from the policy itself so a supervisor can share one
/// `RestartPolicy` across many children while giving each its own history.
#[derive(Debug, Default)]
pub struct RestartTracker {
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a restart attempt and report whether it is permitted under
    /// `policy`. Restarts older than `policy.window` are evicted first, so
    /// the count only ever reflects attempts within the trailing window.
    pub fn record_restart(&mut self, policy: &RestartPolicy, now: Instant) -> bool {
        while let Some(&front) = self.restarts.front() {
            if now.duration_since(front) > policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() as u32 >= policy.max_restarts {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    /// Number of restarts currently counted within the window, as of the
    /// last [`record_restart`](Self::record_restart) call.
    pub fn count(&self) -> usize {
        self.restarts.len()
    }
}

/// Generic one-for-one supervisor: restarts a single child actor on
/// failure, stopping it permanently once its [`RestartPolicy`] budget is
/// exhausted.
///
/// `spawn` is called once at construction and again on every permitted
/// restart; it must produce a fresh `ActorRef<M>` for the freshly spawned
/// child. The supervisor itself holds no mailbox — it is driven by its
/// owner calling [`Supervisor::on_failure`] when the child is observed to
/// have crashed.
pub struct Supervisor<M> {
    policy: RestartPolicy,
    tracker: RestartTracker,
    child: crate::actor::ActorRef<M>,
    stopped: bool,
}

impl<M> Supervisor<M> {
    pub fn new(policy: RestartPolicy, child: crate::actor::ActorRef<M>) -> Self {
        Self {
            policy,
            tracker: RestartTracker::new(),
            child,
            stopped: false,
        }
    }

    /// Current handle to the supervised child, if it hasn't been
    /// permanently stopped.
    pub fn child(&self) -> Option<&crate::actor::ActorRef<M>> {
        if self.stopped {
            None
        } else {
            Some(&self.child)
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Report a crash and, if the restart budget allows it, install the
    /// freshly spawned replacement returned by `spawn`. Returns `true` if a
    /// restart happened, `false` if the child was instead stopped
    /// permanently.
    pub fn on_failure(
        &mut self,
        now: Instant,
        spawn: impl FnOnce() -> crate::actor::ActorRef<M>,
    ) -> bool {
        if self.tracker.record_restart(&self.policy, now) {
            self.child = spawn();
            true
        } else {
            self.stopped = true;
            false
        }
    }
}
