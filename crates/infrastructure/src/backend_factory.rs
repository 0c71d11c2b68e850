use std::sync::Arc;
use tracing::{debug, info};

use runner_config::DatabaseConfig;
use runner_domain::messaging::MessageQueue;
use runner_domain::repositories::TaskStateStore;
use runner_errors::{RunnerError, RunnerResult};

use crate::{
    DatabaseManager, InMemoryMessageQueue, InMemoryTaskStateStore, SqliteMessageQueue,
    SqliteTaskStateStore,
};

/// 一组配套的任务状态存储与任务队列
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn TaskStateStore>,
    pub queue: Arc<dyn MessageQueue>,
    /// 为 true 时其他进程可以通过同一个数据库提交和查询任务
    pub shared: bool,
}

pub struct BackendFactory;

impl BackendFactory {
    /// 按配置选择后端
    ///
    /// 配置了 `database.url` 时存储和队列共用一个 SQLite 连接池；
    /// 否则两者都在进程内，只对本进程可见。
    pub async fn create(config: &DatabaseConfig) -> RunnerResult<Backends> {
        Self::validate_config(config)?;

        match &config.url {
            Some(url) => {
                info!("Initializing SQLite task state store and queue: {}", url);
                let manager = DatabaseManager::new(config).await?;
                let pool = manager.pool().clone();
                Ok(Backends {
                    store: Arc::new(SqliteTaskStateStore::new(pool.clone())),
                    queue: Arc::new(SqliteMessageQueue::new(pool)),
                    shared: true,
                })
            }
            None => {
                debug!("No database.url configured, using in-memory store and queue");
                Ok(Backends {
                    store: Arc::new(InMemoryTaskStateStore::new()),
                    queue: Arc::new(InMemoryMessageQueue::new()),
                    shared: false,
                })
            }
        }
    }

    pub fn validate_config(config: &DatabaseConfig) -> RunnerResult<()> {
        if let Some(url) = &config.url {
            if !url.starts_with("sqlite:") {
                return Err(RunnerError::Configuration(
                    "database.url 必须以 sqlite: 开头".to_string(),
                ));
            }
        }
        if config.max_connections == 0 {
            return Err(RunnerError::Configuration(
                "database.max_connections 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_domain::entities::{Message, NewTask, TaskExecutionMessage, TaskStatus};

    fn message(task_id: &str) -> Message {
        Message::task_execution(TaskExecutionMessage {
            task_id: task_id.to_string(),
            host: "192.168.1.100".to_string(),
            script_name: "hello.py".to_string(),
            script_content: "print('hi')".to_string(),
        })
    }

    #[tokio::test]
    async fn test_default_config_uses_in_memory_backends() {
        let backends = BackendFactory::create(&DatabaseConfig::default())
            .await
            .unwrap();
        assert!(!backends.shared);

        let task = backends
            .store
            .create(NewTask::new("task-1", "192.168.1.100", "hello.py", "print('hi')"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_sqlite_url_shares_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: Some(format!("sqlite:{}", dir.path().join("runner.db").display())),
            max_connections: 2,
        };

        let submitter = BackendFactory::create(&config).await.unwrap();
        assert!(submitter.shared);
        submitter
            .store
            .create(NewTask::new("task-1", "192.168.1.100", "hello.py", "print('hi')"))
            .await
            .unwrap();
        submitter
            .queue
            .publish_message("default", &message("task-1"))
            .await
            .unwrap();

        // 另一份后端实例看到同样的数据，相当于另一个进程
        let server = BackendFactory::create(&config).await.unwrap();
        assert_eq!(
            server.store.get("task-1").await.unwrap().status,
            TaskStatus::Queued
        );
        let consumed = server.queue.consume_messages("default", 10).await.unwrap();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].task.task_id, "task-1");
    }

    #[test]
    fn test_validate_config_rejects_other_schemes() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost/runner".to_string()),
            max_connections: 5,
        };
        assert!(matches!(
            BackendFactory::validate_config(&config),
            Err(RunnerError::Configuration(_))
        ));
    }
}
