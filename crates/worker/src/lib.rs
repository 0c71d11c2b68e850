//! # Runner Worker
//!
//! `TaskRunner` 把一条执行请求驱动到终态，`WorkerLifecycle` 负责轮询队列、
//! 限制并发以及优雅停止。

pub mod components;

pub use components::{ExecutionReport, TaskRunner, WorkerLifecycle, WriteRetryPolicy};
