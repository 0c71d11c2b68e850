pub mod task_execution;
pub mod worker_lifecycle;

pub use task_execution::{ExecutionReport, TaskRunner, WriteRetryPolicy};
pub use worker_lifecycle::WorkerLifecycle;
