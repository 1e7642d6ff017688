//! Taskworker - pulls task activations from a broker and executes them
//!
//! This crate provides the worker process:
//! - Task registry and the built-in `examples` tasks
//! - Child executors with hard processing deadlines
//! - A pool of child processes (or threads) fed by bounded queues
//! - Result reporting with retry of transient broker failures
//! - The `TaskWorker` fetch loop and graceful shutdown

pub mod child;
pub mod context;
pub mod handlers;
pub mod idempotency;
pub mod ipc;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod reporter;
pub mod shutdown;
pub mod worker;

pub use child::{ChildExecutor, ChildExit, ChildOptions, DEADLINE_EXCEEDED_EXIT_CODE};
pub use context::{current_task, TaskContext};
pub use handlers::register_builtin_tasks;
pub use idempotency::{AtMostOnceGate, AtMostOnceStore, MemoryAtMostOnceStore};
pub use ipc::{child_main, ProcessCommand};
pub use monitor::{CheckIn, ExecutionError, Monitor, MonitorStatus, RecordingMonitor, TracingMonitor};
pub use pool::{ChildLauncher, PoolError, PoolOptions, WorkerPool};
pub use registry::{RetryPolicy, TaskDefinition, TaskError, TaskHandler, TaskRegistry};
pub use reporter::{Delivery, ReporterOptions, ResultReporter};
pub use shutdown::ShutdownSignal;
pub use worker::{TaskWorker, Tick, WorkerError, WorkerState};
