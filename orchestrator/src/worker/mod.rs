//! Runtime-owning agents: the worker itself, its runtime and task-table
//! sub-actors, the pluggable runtime-process abstraction, and the
//! supervisor that restarts a worker that crashes.

pub mod runtime;
pub mod supervisor;
pub mod tasks;
pub mod types;
pub mod worker;

pub use runtime::{RuntimeHandle, WorkerRuntime};
pub use supervisor::{WorkerSupervisor, WorkerSupervisorHandle};
pub use tasks::{WorkerTasks, WorkerTasksHandle};
pub use types::{
    build_runtime, classify_line, ActivityState, DemoRuntime, LineOutcome, RuntimeHandles,
    RuntimeKind, RuntimeProcess, Subprocess,
};
pub use worker::{graph_notice_ref, Worker, WorkerConfig, WorkerHandle, WorkerMsg};
