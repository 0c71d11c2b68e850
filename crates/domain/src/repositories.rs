//! 领域仓储抽象
//!
//! 任务状态存储是"发生了什么"的唯一事实来源，外部轮询只读取这里。

use async_trait::async_trait;
use runner_errors::RunnerResult;

use crate::entities::{NewTask, Task, TaskTransition};

/// 任务状态存储
///
/// 实现必须保证读者只能看到转换前或转换后的完整记录，
/// 同一任务的转换串行化，不同任务的转换互不阻塞。
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    /// 创建 `queued` 状态的任务，任务ID已存在时返回 `DuplicateTask`
    async fn create(&self, new_task: NewTask) -> RunnerResult<Task>;

    /// 按ID读取任务，不存在时返回 `TaskNotFound`
    async fn get(&self, task_id: &str) -> RunnerResult<Task>;

    /// 比较并设置式的状态转换，终态任务返回 `InvalidTransition`
    async fn transition(&self, task_id: &str, transition: TaskTransition) -> RunnerResult<Task>;
}
