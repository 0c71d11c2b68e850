use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use runner_domain::entities::{
    DeploymentOutcome, FailureDetail, FailureKind, Task, TaskExecutionMessage, TaskTransition,
};
use runner_domain::repositories::TaskStateStore;
use runner_config::WorkerConfig;
use runner_errors::{RunnerError, RunnerResult};
use runner_remote::ScriptDeployer;
use tracing::{error, info, instrument, warn};

/// 一次投递的处理结果，决定消息如何确认
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    /// 任务已写入终态
    Finished(Task),
    /// 任务在投递前已经是终态（重复投递），未再次执行
    SkippedTerminal(Task),
    /// 存储中没有这个任务
    UnknownTask,
    /// 脚本已执行，但结果和兜底的失败记录都没能写入存储
    Unrecorded(DeploymentOutcome),
}

/// 终态写入的重试策略：指数退避，有上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl WriteRetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.terminal_write_attempts.max(1),
            initial_backoff: config.terminal_write_backoff(),
            ..Self::default()
        }
    }

    /// 第 `attempt` 次失败之后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Task Runner：把一条队列请求驱动到终态
///
/// 部署协议的失败全部以 `DeploymentOutcome::Failed` 的形式落到任务记录里。
/// 只有协议开始之前的存储错误以 `Err` 返回，由调用方决定是否重新投递；
/// 协议一旦执行过，结果按 `WriteRetryPolicy` 重试写入，不会因为写入失败再执行一次。
pub struct TaskRunner {
    worker_id: String,
    store: Arc<dyn TaskStateStore>,
    deployer: Arc<ScriptDeployer>,
    write_retry: WriteRetryPolicy,
}

impl TaskRunner {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn TaskStateStore>,
        deployer: Arc<ScriptDeployer>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            deployer,
            write_retry: WriteRetryPolicy::default(),
        }
    }

    pub fn with_write_retry(mut self, policy: WriteRetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[instrument(
        skip_all,
        fields(
            task_id = %request.task_id,
            host = %request.host,
            script_name = %request.script_name,
            worker_id = %self.worker_id
        )
    )]
    pub async fn execute(&self, request: TaskExecutionMessage) -> RunnerResult<ExecutionReport> {
        let task = match self.store.get(&request.task_id).await {
            Ok(task) => task,
            Err(RunnerError::TaskNotFound { .. }) => {
                error!("收到未登记的任务，消息将被丢弃: task_id={}", request.task_id);
                return Ok(ExecutionReport::UnknownTask);
            }
            Err(e) => return Err(e),
        };

        if task.is_terminal() {
            info!(
                "任务已处于终态 {}，跳过重复投递: task_id={}",
                task.status, task.task_id
            );
            return Ok(ExecutionReport::SkippedTerminal(task));
        }

        match self
            .store
            .transition(&request.task_id, TaskTransition::Start)
            .await
        {
            Ok(_) => {}
            Err(RunnerError::InvalidTransition { .. }) => return self.already_finished(&request).await,
            Err(e) => return Err(e),
        }
        metrics::counter!("runner_tasks_started_total").increment(1);
        info!("开始执行任务: task_id={}", request.task_id);

        let task_id = request.task_id.clone();
        let outcome = self.run_protocol(request).await;
        record_outcome(&outcome);

        match &outcome {
            DeploymentOutcome::Completed { .. } => {
                info!("任务执行成功: task_id={}", task_id);
            }
            DeploymentOutcome::Failed(detail) if detail.kind == FailureKind::UnexpectedFailure => {
                error!("任务执行出现未预期错误: task_id={}, {}", task_id, detail);
            }
            DeploymentOutcome::Failed(detail) => {
                info!("任务执行失败: task_id={}, {}", task_id, detail);
            }
        }

        self.record_terminal(&task_id, outcome).await
    }

    /// 把任务直接写为 `UnexpectedFailure`，用于无法继续处理的投递
    ///
    /// 任务已经是终态时返回现有记录。
    pub async fn abandon(&self, task_id: &str, reason: impl Into<String>) -> RunnerResult<Task> {
        let task = self.write_unexpected_failure(task_id, reason.into()).await?;
        metrics::counter!(
            "runner_tasks_failed_total",
            "kind" => FailureKind::UnexpectedFailure.as_str()
        )
        .increment(1);
        Ok(task)
    }

    /// 写入已知的执行结果：可重试的错误按退避重试，
    /// 重试用尽或遇到不可重试的错误时兜底写一次 `UnexpectedFailure`
    async fn record_terminal(
        &self,
        task_id: &str,
        outcome: DeploymentOutcome,
    ) -> RunnerResult<ExecutionReport> {
        let transition = TaskTransition::from(outcome.clone());
        let mut attempt = 1;
        let write_error = loop {
            match self.store.transition(task_id, transition.clone()).await {
                Ok(task) => return Ok(ExecutionReport::Finished(task)),
                Err(RunnerError::InvalidTransition { .. }) => {
                    warn!("任务已被其他执行者写入终态: task_id={}", task_id);
                    let task = self.store.get(task_id).await?;
                    return Ok(ExecutionReport::SkippedTerminal(task));
                }
                Err(e) if e.is_retryable() && attempt < self.write_retry.max_attempts => {
                    let delay = self.write_retry.backoff(attempt);
                    warn!(
                        "写入任务终态失败，{:?} 后重试 ({}/{}): task_id={}, error={}",
                        delay, attempt, self.write_retry.max_attempts, task_id, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        error!(
            "任务结果无法写入，改记为 UnexpectedFailure: task_id={}, error={}",
            task_id, write_error
        );
        let detail = FailureDetail::new(
            FailureKind::UnexpectedFailure,
            format!("failed to record deployment outcome: {write_error}"),
        );
        match self
            .store
            .transition(task_id, TaskTransition::Fail(detail))
            .await
        {
            Ok(task) => Ok(ExecutionReport::Finished(task)),
            Err(RunnerError::InvalidTransition { .. }) => {
                let task = self.store.get(task_id).await?;
                Ok(ExecutionReport::SkippedTerminal(task))
            }
            Err(e) => {
                error!(
                    "兜底失败记录也无法写入，任务停留在 running: task_id={}, error={}",
                    task_id, e
                );
                Ok(ExecutionReport::Unrecorded(outcome))
            }
        }
    }

    async fn write_unexpected_failure(&self, task_id: &str, reason: String) -> RunnerResult<Task> {
        let detail = FailureDetail::new(FailureKind::UnexpectedFailure, reason);
        match self
            .store
            .transition(task_id, TaskTransition::Fail(detail))
            .await
        {
            Ok(task) => Ok(task),
            Err(RunnerError::InvalidTransition { .. }) => self.store.get(task_id).await,
            Err(e) => Err(e),
        }
    }

    /// 在独立的 tokio 任务中运行部署协议，panic 转为 `UnexpectedFailure`
    async fn run_protocol(&self, request: TaskExecutionMessage) -> DeploymentOutcome {
        let deployer = Arc::clone(&self.deployer);
        let handle = tokio::spawn(async move {
            deployer
                .deploy_and_run_default(
                    &request.host,
                    &request.script_content,
                    &request.script_name,
                )
                .await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                DeploymentOutcome::Failed(FailureDetail::new(
                    FailureKind::UnexpectedFailure,
                    format!("deployment panicked: {message}"),
                ))
            }
            Err(join_error) => DeploymentOutcome::failed(
                FailureKind::UnexpectedFailure,
                format!("deployment task aborted: {join_error}"),
            ),
        }
    }

    async fn already_finished(
        &self,
        request: &TaskExecutionMessage,
    ) -> RunnerResult<ExecutionReport> {
        let task = self.store.get(&request.task_id).await?;
        info!(
            "任务在开始前已进入终态 {}: task_id={}",
            task.status, task.task_id
        );
        Ok(ExecutionReport::SkippedTerminal(task))
    }
}

fn record_outcome(outcome: &DeploymentOutcome) {
    match outcome {
        DeploymentOutcome::Completed { .. } => {
            metrics::counter!("runner_tasks_succeeded_total").increment(1);
        }
        DeploymentOutcome::Failed(detail) => {
            metrics::counter!("runner_tasks_failed_total", "kind" => detail.kind.as_str())
                .increment(1);
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
