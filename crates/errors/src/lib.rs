use thiserror::Error;

#[cfg(test)]
mod tests;

/// 统一的错误类型
///
/// 远程执行本身的失败（连接、部署、执行、超时）不会出现在这里，
/// 它们以 `DeploymentOutcome::Failed` 的形式作为任务结果记录。
/// 这里只包含调用方需要处理的契约违反和基础设施错误。
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("任务已存在: {task_id}")]
    DuplicateTask { task_id: String },
    #[error("无效的状态转换: 任务 {task_id} 不能从 {from} 转换到 {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

impl RunnerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }
    pub fn duplicate_task<S: Into<String>>(task_id: S) -> Self {
        Self::DuplicateTask {
            task_id: task_id.into(),
        }
    }
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 任务状态存储的契约错误，属于调用方的集成问题而不是远程执行失败
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            RunnerError::TaskNotFound { .. }
                | RunnerError::DuplicateTask { .. }
                | RunnerError::InvalidTransition { .. }
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::Database(_)
                | RunnerError::DatabaseOperation(_)
                | RunnerError::MessageQueue(_)
                | RunnerError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        RunnerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for RunnerError {
    fn from(err: anyhow::Error) -> Self {
        RunnerError::Internal(err.to_string())
    }
}
