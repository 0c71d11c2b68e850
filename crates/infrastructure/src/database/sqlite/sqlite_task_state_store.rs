use async_trait::async_trait;
use chrono::Utc;
use runner_domain::{
    entities::{NewTask, Task, TaskStatus, TaskTransition},
    repositories::TaskStateStore,
};
use runner_errors::{RunnerError, RunnerResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "task_id, name, host, script_name, script_content, status, \
    experiment_id, result, error, created_at, updated_at, started_at, completed_at";

const ALL_STATUSES: [TaskStatus; 4] = [
    TaskStatus::Queued,
    TaskStatus::Running,
    TaskStatus::Success,
    TaskStatus::Failure,
];

/// SQLite 任务状态存储
///
/// 每个任务一行。状态转换是一条带 `WHERE status IN (..)` 条件的 UPDATE，
/// 由数据库完成比较并设置，结果和错误以 JSON 文本保存。
pub struct SqliteTaskStateStore {
    pool: SqlitePool,
}

impl SqliteTaskStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> RunnerResult<Task> {
        Ok(Task {
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            script_name: row.try_get("script_name")?,
            script_content: row.try_get("script_content")?,
            status: MappingHelpers::status_column(row)?,
            experiment_id: row.try_get("experiment_id")?,
            result: MappingHelpers::result_column(row)?,
            error: MappingHelpers::error_column(row)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn current_status(&self, task_id: &str) -> RunnerResult<Option<TaskStatus>> {
        let row = sqlx::query("SELECT status FROM task_states WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(MappingHelpers::status_column).transpose()
    }
}

#[async_trait]
impl TaskStateStore for SqliteTaskStateStore {
    #[instrument(skip(self, new_task), fields(task_id = %new_task.task_id, host = %new_task.host))]
    async fn create(&self, new_task: NewTask) -> RunnerResult<Task> {
        let task = Task::new(new_task);

        let result = sqlx::query(
            r#"
            INSERT INTO task_states (task_id, name, host, script_name, script_content, status,
                                     experiment_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.name)
        .bind(&task.host)
        .bind(&task.script_name)
        .bind(&task.script_content)
        .bind(task.status.as_str())
        .bind(task.experiment_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("任务已写入SQLite: task_id={}", task.task_id);
                Ok(task)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(RunnerError::duplicate_task(task.task_id))
            }
            Err(e) => Err(RunnerError::Database(e)),
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, task_id: &str) -> RunnerResult<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_states WHERE task_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => Err(RunnerError::task_not_found(task_id)),
        }
    }

    #[instrument(skip(self, transition), fields(to = %transition.target_status()))]
    async fn transition(&self, task_id: &str, transition: TaskTransition) -> RunnerResult<Task> {
        let target = transition.target_status();
        let allowed: Vec<TaskStatus> = ALL_STATUSES
            .into_iter()
            .filter(|status| transition.is_allowed_from(*status))
            .collect();

        let (set_clause, payload) = match &transition {
            TaskTransition::Start => ("started_at = COALESCE(started_at, ?)", None),
            TaskTransition::Succeed(result) => (
                "result = ?, error = NULL, completed_at = COALESCE(completed_at, ?)",
                MappingHelpers::to_json_text(Some(result))?,
            ),
            TaskTransition::Fail(detail) => (
                "error = ?, result = NULL, completed_at = COALESCE(completed_at, ?)",
                MappingHelpers::to_json_text(Some(detail))?,
            ),
        };

        let placeholders = vec!["?"; allowed.len()].join(", ");
        let sql = format!(
            "UPDATE task_states SET status = ?, {set_clause}, updated_at = ? \
             WHERE task_id = ? AND status IN ({placeholders}) \
             RETURNING {TASK_COLUMNS}"
        );

        let now = Utc::now();
        let mut query = sqlx::query(&sql).bind(target.as_str());
        if let Some(payload) = payload {
            query = query.bind(payload);
        }
        query = query.bind(now).bind(now).bind(task_id);
        for status in &allowed {
            query = query.bind(status.as_str());
        }

        if let Some(row) = query.fetch_optional(&self.pool).await? {
            let task = Self::row_to_task(&row)?;
            debug!("任务状态已更新: task_id={}, status={}", task_id, task.status);
            return Ok(task);
        }

        // 没有行被更新：要么任务不存在，要么当前状态不允许该转换
        match self.current_status(task_id).await? {
            None => Err(RunnerError::task_not_found(task_id)),
            Some(current) => Err(RunnerError::invalid_transition(
                task_id,
                current.as_str(),
                target.as_str(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::DatabaseManager;
    use runner_config::DatabaseConfig;
    use runner_domain::entities::{ExecutionResult, FailureDetail, FailureKind};

    async fn memory_store() -> SqliteTaskStateStore {
        let config = DatabaseConfig {
            url: Some("sqlite::memory:".to_string()),
            max_connections: 5,
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        SqliteTaskStateStore::new(manager.pool().clone())
    }

    fn new_task(task_id: &str) -> NewTask {
        NewTask::new(task_id, "192.168.1.100", "hello.py", "print('hi')").with_experiment(7)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = memory_store().await;
        let created = store.create(new_task("task-1")).await.unwrap();

        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.host, "192.168.1.100");
        assert_eq!(task.script_name, "hello.py");
        assert_eq!(task.name, "Execute hello.py");
        assert_eq!(task.experiment_id, Some(7));
        assert_eq!(task.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = memory_store().await;
        store.create(new_task("task-1")).await.unwrap();

        let duplicate = store.create(new_task("task-1")).await;
        assert!(matches!(duplicate, Err(RunnerError::DuplicateTask { .. })));

        let missing = store.get("nonexistent-id").await;
        assert!(matches!(missing, Err(RunnerError::TaskNotFound { .. })));

        let missing = store.transition("nonexistent-id", TaskTransition::Start).await;
        assert!(matches!(missing, Err(RunnerError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_lifecycle_persists_result() {
        let store = memory_store().await;
        store.create(new_task("task-1")).await.unwrap();

        let running = store.transition("task-1", TaskTransition::Start).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        let started_at = running.started_at.expect("started_at set");

        // 重新投递再次开始时保留首次开始时间
        let again = store.transition("task-1", TaskTransition::Start).await.unwrap();
        assert_eq!(again.started_at, Some(started_at));

        let done = store
            .transition(
                "task-1",
                TaskTransition::Succeed(ExecutionResult {
                    stdout: "hi\n".to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                }),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(done.completed_at.is_some());

        let reloaded = store.get("task-1").await.unwrap();
        assert_eq!(reloaded.result.map(|r| r.stdout), Some("hi\n".to_string()));
        assert!(reloaded.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_persists_error_detail() {
        let store = memory_store().await;
        store.create(new_task("task-1")).await.unwrap();
        store.transition("task-1", TaskTransition::Start).await.unwrap();

        let detail = FailureDetail::new(FailureKind::ExecutionFailure, "script exited with code 1")
            .with_output("", "Traceback\n");
        store
            .transition("task-1", TaskTransition::Fail(detail.clone()))
            .await
            .unwrap();

        let reloaded = store.get("task-1").await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failure);
        assert_eq!(reloaded.error, Some(detail));
        assert!(reloaded.result.is_none());
    }

    #[tokio::test]
    async fn test_terminal_and_skipping_transitions_rejected() {
        let store = memory_store().await;
        store.create(new_task("task-1")).await.unwrap();

        let skip = store
            .transition(
                "task-1",
                TaskTransition::Succeed(ExecutionResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                }),
            )
            .await;
        assert!(matches!(skip, Err(RunnerError::InvalidTransition { .. })));

        store
            .transition(
                "task-1",
                TaskTransition::Fail(FailureDetail::new(FailureKind::ConnectionFailure, "refused")),
            )
            .await
            .unwrap();

        let restart = store.transition("task-1", TaskTransition::Start).await;
        match restart {
            Err(RunnerError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, "failure");
                assert_eq!(to, "running");
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(
            store.get("task-1").await.unwrap().status,
            TaskStatus::Failure
        );
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.db");
        let config = DatabaseConfig {
            url: Some(format!("sqlite:{}", path.display())),
            max_connections: 2,
        };

        {
            let manager = DatabaseManager::new(&config).await.unwrap();
            let store = SqliteTaskStateStore::new(manager.pool().clone());
            store.create(new_task("task-1")).await.unwrap();
            store.transition("task-1", TaskTransition::Start).await.unwrap();
            manager.close().await;
        }

        let manager = DatabaseManager::new(&config).await.unwrap();
        let store = SqliteTaskStateStore::new(manager.pool().clone());
        assert_eq!(
            store.get("task-1").await.unwrap().status,
            TaskStatus::Running
        );
    }
}
