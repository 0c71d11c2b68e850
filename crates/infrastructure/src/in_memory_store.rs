use async_trait::async_trait;
use runner_domain::entities::{NewTask, Task, TaskTransition};
use runner_domain::repositories::TaskStateStore;
use runner_errors::{RunnerError, RunnerResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// 进程内任务状态存储
///
/// 外层读写锁只保护ID到记录单元的映射，每条记录有自己的互斥锁，
/// 不同任务的状态转换互不阻塞。
#[derive(Debug, Default)]
pub struct InMemoryTaskStateStore {
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
}

impl InMemoryTaskStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn task_ids(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }

    async fn cell(&self, task_id: &str) -> RunnerResult<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| RunnerError::task_not_found(task_id))
    }
}

#[async_trait]
impl TaskStateStore for InMemoryTaskStateStore {
    async fn create(&self, new_task: NewTask) -> RunnerResult<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&new_task.task_id) {
            return Err(RunnerError::duplicate_task(new_task.task_id));
        }

        let task = Task::new(new_task);
        tasks.insert(task.task_id.clone(), Arc::new(Mutex::new(task.clone())));
        debug!("任务已创建: task_id={}, host={}", task.task_id, task.host);
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> RunnerResult<Task> {
        let cell = self.cell(task_id).await?;
        let task = cell.lock().await.clone();
        Ok(task)
    }

    async fn transition(&self, task_id: &str, transition: TaskTransition) -> RunnerResult<Task> {
        let cell = self.cell(task_id).await?;
        let mut task = cell.lock().await;

        // 在副本上应用，失败时原记录保持不变
        let mut updated = task.clone();
        updated.apply(transition)?;
        *task = updated.clone();

        debug!(
            "任务状态已更新: task_id={}, status={}",
            task_id, updated.status
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_domain::entities::{ExecutionResult, FailureDetail, FailureKind, TaskStatus};

    fn new_task(task_id: &str) -> NewTask {
        NewTask::new(task_id, "192.168.1.100", "hello.py", "print('hi')")
    }

    fn success() -> TaskTransition {
        TaskTransition::Succeed(ExecutionResult {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    #[tokio::test]
    async fn test_create_then_get_is_queued() {
        let store = InMemoryTaskStateStore::new();
        store.create(new_task("task-1")).await.unwrap();

        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.host, "192.168.1.100");
        assert_eq!(task.script_name, "hello.py");
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let store = InMemoryTaskStateStore::new();
        store.create(new_task("task-1")).await.unwrap();

        let result = store.create(new_task("task-1")).await;
        assert!(matches!(result, Err(RunnerError::DuplicateTask { .. })));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = InMemoryTaskStateStore::new();
        let result = store.get("nonexistent-id").await;
        assert!(matches!(result, Err(RunnerError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let store = InMemoryTaskStateStore::new();
        store.create(new_task("task-1")).await.unwrap();

        let running = store.transition("task-1", TaskTransition::Start).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = store.transition("task-1", success()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result.as_ref().map(|r| r.stdout.as_str()), Some("hi\n"));
        assert!(done.error.is_none());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_record_unchanged() {
        let store = InMemoryTaskStateStore::new();
        store.create(new_task("task-1")).await.unwrap();
        store
            .transition(
                "task-1",
                TaskTransition::Fail(FailureDetail::new(FailureKind::ConnectionFailure, "refused")),
            )
            .await
            .unwrap();
        let before = store.get("task-1").await.unwrap();

        let result = store.transition("task-1", TaskTransition::Start).await;
        assert!(matches!(result, Err(RunnerError::InvalidTransition { .. })));
        assert_eq!(store.get("task-1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_transition_unknown_is_not_found() {
        let store = InMemoryTaskStateStore::new();
        let result = store.transition("missing", TaskTransition::Start).await;
        assert!(matches!(result, Err(RunnerError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_terminal_transitions_only_one_wins() {
        let store = Arc::new(InMemoryTaskStateStore::new());
        store.create(new_task("task-1")).await.unwrap();
        store.transition("task-1", TaskTransition::Start).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let transition = if i % 2 == 0 {
                    success()
                } else {
                    TaskTransition::Fail(FailureDetail::new(FailureKind::UnexpectedFailure, "x"))
                };
                store.transition("task-1", transition).await.is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(store.get("task-1").await.unwrap().is_terminal());
    }
}
