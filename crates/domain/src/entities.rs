use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use runner_errors::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务状态
///
/// ```text
/// queued → running → success
///             ↓
///           failure
/// ```
/// `success` 与 `failure` 为终态，进入终态后不再发生任何转换。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            _ => Err(RunnerError::Serialization(format!(
                "Invalid task status: {s}"
            ))),
        }
    }
}

/// 远程执行失败分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// 无法建立远程会话（网络、认证、主机不可达）
    ConnectionFailure,
    /// 会话已建立，但创建目录或上传脚本失败
    DeployFailure,
    /// 脚本已运行但退出码非零
    ExecutionFailure,
    /// 某一步骤超过了时间限制
    TimeoutFailure,
    /// 未分类的异常
    UnexpectedFailure,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::ConnectionFailure,
        FailureKind::DeployFailure,
        FailureKind::ExecutionFailure,
        FailureKind::TimeoutFailure,
        FailureKind::UnexpectedFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectionFailure => "ConnectionFailure",
            FailureKind::DeployFailure => "DeployFailure",
            FailureKind::ExecutionFailure => "ExecutionFailure",
            FailureKind::TimeoutFailure => "TimeoutFailure",
            FailureKind::UnexpectedFailure => "UnexpectedFailure",
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            FailureKind::ConnectionFailure => "could not establish remote session",
            FailureKind::DeployFailure => "could not deploy script to remote host",
            FailureKind::ExecutionFailure => "script exited with non-zero status",
            FailureKind::TimeoutFailure => "remote operation timed out",
            FailureKind::UnexpectedFailure => "unexpected failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败详情，既是部署协议的失败结果，也是失败任务记录中的 `error`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    /// 执行失败时捕获的标准输出
    pub stdout: Option<String>,
    /// 执行失败时捕获的标准错误
    pub stderr: Option<String>,
}

impl FailureDetail {
    /// 空消息会被替换为该分类的默认描述，保证失败信息永远可读
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.default_message().to_string()
        } else {
            message
        };
        Self {
            kind,
            message,
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// 成功任务的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// 部署协议的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome")]
pub enum DeploymentOutcome {
    Completed { stdout: String, stderr: String },
    Failed(FailureDetail),
}

impl DeploymentOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        DeploymentOutcome::Failed(FailureDetail::new(kind, message))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DeploymentOutcome::Completed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DeploymentOutcome::Completed { .. } => None,
            DeploymentOutcome::Failed(detail) => Some(detail.kind),
        }
    }
}

/// 状态转换请求
///
/// 结果与错误随目标状态一起携带，成功记录只可能有 `result`，
/// 失败记录只可能有 `error`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    Start,
    Succeed(ExecutionResult),
    Fail(FailureDetail),
}

impl TaskTransition {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            TaskTransition::Start => TaskStatus::Running,
            TaskTransition::Succeed(_) => TaskStatus::Success,
            TaskTransition::Fail(_) => TaskStatus::Failure,
        }
    }

    /// 允许的转换：
    /// - queued/running → running（worker崩溃后的重新投递会再次开始）
    /// - running → success
    /// - queued/running → failure
    pub fn is_allowed_from(&self, current: TaskStatus) -> bool {
        match (current, self) {
            (TaskStatus::Queued | TaskStatus::Running, TaskTransition::Start) => true,
            (TaskStatus::Running, TaskTransition::Succeed(_)) => true,
            (TaskStatus::Queued | TaskStatus::Running, TaskTransition::Fail(_)) => true,
            _ => false,
        }
    }
}

impl From<DeploymentOutcome> for TaskTransition {
    fn from(outcome: DeploymentOutcome) -> Self {
        match outcome {
            DeploymentOutcome::Completed { stdout, stderr } => {
                TaskTransition::Succeed(ExecutionResult {
                    stdout,
                    stderr,
                    exit_code: 0,
                })
            }
            DeploymentOutcome::Failed(detail) => TaskTransition::Fail(detail),
        }
    }
}

/// 新任务的创建参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,
    pub host: String,
    pub script_name: String,
    pub script_content_summary: String,
    pub experiment_id: Option<i64>,
}

impl NewTask {
    pub fn new(
        task_id: impl Into<String>,
        host: impl Into<String>,
        script_name: impl Into<String>,
        script_content_summary: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            host: host.into(),
            script_name: script_name.into(),
            script_content_summary: script_content_summary.into(),
            experiment_id: None,
        }
    }

    pub fn with_experiment(mut self, experiment_id: i64) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub host: String,
    pub script_name: String,
    /// 脚本内容摘要，完整内容只随队列消息传递
    pub script_content: String,
    pub status: TaskStatus,
    pub experiment_id: Option<i64>,
    pub result: Option<ExecutionResult>,
    pub error: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(new_task: NewTask) -> Self {
        let now = Utc::now();
        Self {
            name: format!("Execute {}", new_task.script_name),
            task_id: new_task.task_id,
            host: new_task.host,
            script_name: new_task.script_name,
            script_content: new_task.script_content_summary,
            status: TaskStatus::Queued,
            experiment_id: new_task.experiment_id,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 校验并应用一次状态转换，两种存储实现共用这一份规则
    pub fn apply(&mut self, transition: TaskTransition) -> RunnerResult<()> {
        if !transition.is_allowed_from(self.status) {
            return Err(RunnerError::invalid_transition(
                self.task_id.clone(),
                self.status.as_str(),
                transition.target_status().as_str(),
            ));
        }

        let now = Utc::now();
        self.status = transition.target_status();
        self.updated_at = now;
        match transition {
            TaskTransition::Start => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskTransition::Succeed(result) => {
                self.result = Some(result);
                self.error = None;
                self.completed_at.get_or_insert(now);
            }
            TaskTransition::Fail(detail) => {
                self.error = Some(detail);
                self.result = None;
                self.completed_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// 队列中传递的任务执行请求，携带完整脚本内容
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskExecutionMessage {
    pub task_id: String,
    pub host: String,
    pub script_name: String,
    pub script_content: String,
}

/// 队列消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub task: TaskExecutionMessage,
    pub timestamp: DateTime<Utc>,
    /// 重新投递次数
    pub retry_count: i32,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn task_execution(task: TaskExecutionMessage) -> Self {
        let correlation_id = Some(task.task_id.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id,
        }
    }
}
