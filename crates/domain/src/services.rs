//! # 领域服务模块
//!
//! 任务提交与状态查询。提交方只负责创建 `queued` 记录并把执行请求放入队列，
//! 之后的状态全部由 Task Runner 写入存储，查询永远只读存储。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::entities::{
    FailureDetail, FailureKind, Message, NewTask, Task, TaskExecutionMessage, TaskTransition,
};
use crate::messaging::MessageQueue;
use crate::repositories::TaskStateStore;
use crate::value_objects::{summarize_script_content, validate_host, validate_script_name};
use runner_errors::RunnerResult;

/// 脚本执行请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub host: String,
    pub script_name: String,
    pub script_content: String,
    pub experiment_id: Option<i64>,
}

impl SubmitTaskRequest {
    pub fn new(
        host: impl Into<String>,
        script_name: impl Into<String>,
        script_content: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            script_name: script_name.into(),
            script_content: script_content.into(),
            experiment_id: None,
        }
    }
}

pub struct TaskSubmissionService {
    store: Arc<dyn TaskStateStore>,
    queue: Arc<dyn MessageQueue>,
    task_queue: String,
}

impl TaskSubmissionService {
    pub fn new(
        store: Arc<dyn TaskStateStore>,
        queue: Arc<dyn MessageQueue>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            task_queue: task_queue.into(),
        }
    }

    /// 登记任务并入队，返回 `queued` 状态的记录
    ///
    /// 入队失败时任务会被直接标记为失败，避免留下永远不会被执行的 `queued` 记录。
    pub async fn submit(&self, request: SubmitTaskRequest) -> RunnerResult<Task> {
        validate_host(&request.host)?;
        validate_script_name(&request.script_name)?;

        let task_id = Uuid::new_v4().to_string();
        let mut new_task = NewTask::new(
            task_id.clone(),
            request.host.clone(),
            request.script_name.clone(),
            summarize_script_content(&request.script_content),
        );
        new_task.experiment_id = request.experiment_id;

        let task = self.store.create(new_task).await?;

        let message = Message::task_execution(TaskExecutionMessage {
            task_id: task_id.clone(),
            host: request.host,
            script_name: request.script_name,
            script_content: request.script_content,
        });

        if let Err(e) = self.queue.publish_message(&self.task_queue, &message).await {
            error!("Failed to enqueue task {}: {}", task_id, e);
            let detail = FailureDetail::new(
                FailureKind::UnexpectedFailure,
                format!("failed to enqueue task: {e}"),
            );
            if let Err(store_err) = self
                .store
                .transition(&task_id, TaskTransition::Fail(detail))
                .await
            {
                error!("Failed to mark task {} as failed: {}", task_id, store_err);
            }
            return Err(e);
        }

        info!(
            "任务已入队: task_id={}, host={}, script_name={}",
            task.task_id, task.host, task.script_name
        );
        Ok(task)
    }

    /// 查询任务状态
    pub async fn status(&self, task_id: &str) -> RunnerResult<Task> {
        self.store.get(task_id).await
    }
}
