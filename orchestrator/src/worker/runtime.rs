//! Owns one subprocess (or demo runtime), streams its output, and enforces
//! the per-task token budget.
//!
//! Token tracking is deliberately crude: every output line's character
//! count accumulates into the active task's running total, and `chars ÷ 4`
//! approximates tokens. At 1.0× the configured limit a one-shot warning
//! fires; at 1.2× the runtime is cancelled and the owning task is reported
//! as over budget. Exact token counting is out of scope by design.

use std::sync::Arc;

use crate::actor::{self, ActorRef, CancelToken, Mailbox};
use crate::estimate_tokens;
use crate::events::EventBus;

use super::types::{classify_line, build_runtime, LineOutcome, RuntimeHandles, RuntimeKind};
use super::worker::WorkerMsg;

/// Messages accepted by the [`WorkerRuntime`] actor.
pub enum RuntimeMsg {
    SetActiveTask { task_id: String, max_tokens: Option<u64> },
    ClearActiveTask,
    SendPrompt(String),
    /// Force-cancel the current subprocess/demo cycle (e.g. on shutdown).
    Cancel,
    // internal, fed by the background reader/exit-watcher tasks
    OutputLineInternal(String),
    ExitedInternal(Option<i32>),
}

/// Cloneable handle to a running [`WorkerRuntime`] actor.
#[derive(Clone)]
pub struct RuntimeHandle {
    actor: ActorRef<RuntimeMsg>,
}

impl RuntimeHandle {
    pub fn set_active_task(&self, task_id: impl Into<String>, max_tokens: Option<u64>) {
        let _ = self.actor.send(RuntimeMsg::SetActiveTask {
            task_id: task_id.into(),
            max_tokens,
        });
    }

    pub fn clear_active_task(&self) {
        let _ = self.actor.send(RuntimeMsg::ClearActiveTask);
    }

    pub fn send_prompt(&self, prompt: impl Into<String>) {
        let _ = self.actor.send(RuntimeMsg::SendPrompt(prompt.into()));
    }

    pub fn cancel(&self) {
        let _ = self.actor.send(RuntimeMsg::Cancel);
    }
}

struct ActiveTaskTracking {
    task_id: String,
    max_tokens: Option<u64>,
    chars: usize,
    warned: bool,
}

/// Per-worker runtime supervisor actor.
pub struct WorkerRuntime {
    worker_id: String,
    parent: ActorRef<WorkerMsg>,
    event_bus: EventBus,
    kind: RuntimeKind,
    input: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    cancel: CancelToken,
    active: Option<ActiveTaskTracking>,
}

impl WorkerRuntime {
    pub fn spawn(
        worker_id: impl Into<String>,
        kind: RuntimeKind,
        parent: ActorRef<WorkerMsg>,
        event_bus: EventBus,
    ) -> RuntimeHandle {
        let (actor, mailbox) = actor::mailbox();
        let self_ref = actor.clone();
        let runtime = Self {
            worker_id: worker_id.into(),
            parent,
            event_bus,
            kind,
            input: None,
            cancel: CancelToken::new(),
            active: None,
        };
        actor::spawn_actor(move || runtime.run(mailbox, self_ref));
        RuntimeHandle { actor }
    }

    async fn run(mut self, mut mailbox: Mailbox<RuntimeMsg>, self_ref: ActorRef<RuntimeMsg>) {
        self.start(&self_ref).await;
        while let Some(msg) = mailbox.recv().await {
            match msg {
                RuntimeMsg::SetActiveTask { task_id, max_tokens } => {
                    self.active = Some(ActiveTaskTracking {
                        task_id,
                        max_tokens,
                        chars: 0,
                        warned: false,
                    });
                }
                RuntimeMsg::ClearActiveTask => self.active = None,
                RuntimeMsg::SendPrompt(prompt) => {
                    if let Some(input) = &self.input {
                        let _ = input.send(prompt);
                    }
                }
                RuntimeMsg::Cancel => self.cancel.cancel(),
                RuntimeMsg::OutputLineInternal(line) => self.handle_output_line(line),
                RuntimeMsg::ExitedInternal(exit_code) => {
                    self.event_bus
                        .publish_viewport(crate::events::ViewportEvent::runtime_exited(
                            &self.worker_id,
                            exit_code,
                        ));
                    let _ = self.parent.send(WorkerMsg::RuntimeExited { exit_code });
                }
            }
        }
    }

    async fn start(&mut self, self_ref: &ActorRef<RuntimeMsg>) {
        let process = build_runtime(&self.kind);
        match process.start(self.cancel.clone()).await {
            Ok(RuntimeHandles { input, mut output, exit }) => {
                let reader_ref = self_ref.clone();
                tokio::spawn(async move {
                    while let Some(line) = output.recv().await {
                        if reader_ref.send(RuntimeMsg::OutputLineInternal(line)).is_err() {
                            break;
                        }
                    }
                });

                let exit_ref = self_ref.clone();
                tokio::spawn(async move {
                    if let Ok(code) = exit.await {
                        let _ = exit_ref.send(RuntimeMsg::ExitedInternal(code));
                    }
                });

                self.event_bus
                    .publish_viewport(crate::events::ViewportEvent::runtime_started(
                        &self.worker_id,
                        "default",
                    ));
                self.input = Some(input);
            }
            Err(err) => {
                tracing::warn!(worker_id = %self.worker_id, error = %err, "runtime failed to start");
            }
        }
    }

    fn handle_output_line(&mut self, line: String) {
        self.event_bus
            .publish_viewport(crate::events::ViewportEvent::runtime_output_line(
                &self.worker_id,
                &line,
            ));

        let (state, outcome) = classify_line(&line);
        let _ = self.parent.send(WorkerMsg::RuntimeActivity { state });
        let _ = self.parent.send(WorkerMsg::RuntimeLine { line: line.clone() });

        if let Some(active) = &mut self.active {
            active.chars += line.chars().count();
            let estimated = estimate_tokens(active.chars);
            if let Some(max) = active.max_tokens {
                if !active.warned && estimated >= max {
                    active.warned = true;
                    tracing::warn!(worker_id = %self.worker_id, task_id = %active.task_id, estimated, max, "task approaching token budget");
                }
                if estimated as f64 >= max as f64 * 1.2 {
                    let task_id = active.task_id.clone();
                    self.cancel.cancel();
                    let _ = self.parent.send(WorkerMsg::RuntimeTokenBudgetExceeded {
                        task_id,
                        estimated,
                        max,
                    });
                    return;
                }
            }
        }

        match outcome {
            LineOutcome::Continues => {}
            LineOutcome::TaskComplete { summary } => {
                if let Some(active) = self.active.take() {
                    let estimated_tokens = estimate_tokens(active.chars);
                    let _ = self.parent.send(WorkerMsg::RuntimeTaskComplete {
                        task_id: active.task_id,
                        summary,
                        estimated_tokens,
                    });
                }
            }
            LineOutcome::TaskFailed { reason } => {
                if let Some(active) = self.active.take() {
                    let estimated_tokens = estimate_tokens(active.chars);
                    let _ = self.parent.send(WorkerMsg::RuntimeTaskFailed {
                        task_id: active.task_id,
                        reason,
                        estimated_tokens,
                    });
                }
            }
            LineOutcome::TaskDecompose { json } => {
                // the task is not finished: a decomposition proposal still
                // awaits the graph's accept/reject, so `active` stays armed
                if let Some(active) = &self.active {
                    let _ = self.parent.send(WorkerMsg::RuntimeTaskDecompose {
                        task_id: active.task_id.clone(),
                        json,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::worker::WorkerMsg;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_demo_runtime_streams_to_parent() {
        let (parent, mut parent_mailbox) = actor::mailbox::<WorkerMsg>();
        let _handle = WorkerRuntime::spawn("w1", RuntimeKind::Demo, parent, EventBus::new());

        let mut saw_line = false;
        let mut saw_complete = false;
        for _ in 0..20 {
            if let Some(msg) = tokio::time::timeout(std::time::Duration::from_secs(2), parent_mailbox.recv())
                .await
                .ok()
                .flatten()
            {
                match msg {
                    WorkerMsg::RuntimeLine { .. } => saw_line = true,
                    WorkerMsg::RuntimeTaskComplete { .. } => {
                        saw_complete = true;
                        break;
                    }
                    _ => {}
                }
            } else {
                break;
            }
        }
        assert!(saw_line);
        assert!(saw_complete);
    }
}
