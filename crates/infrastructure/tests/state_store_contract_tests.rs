use std::sync::Arc;

use runner_config::DatabaseConfig;
use runner_domain::{
    ExecutionResult, FailureDetail, FailureKind, NewTask, RunnerError, TaskStatus,
    TaskStateStore, TaskTransition,
};
use runner_infrastructure::{DatabaseManager, InMemoryTaskStateStore, SqliteTaskStateStore};

/// 两种存储实现必须满足同一份契约
async fn stores() -> Vec<(&'static str, Arc<dyn TaskStateStore>)> {
    let config = DatabaseConfig {
        url: Some("sqlite::memory:".to_string()),
        max_connections: 1,
    };
    let manager = DatabaseManager::new(&config).await.unwrap();

    vec![
        ("in-memory", Arc::new(InMemoryTaskStateStore::new())),
        (
            "sqlite",
            Arc::new(SqliteTaskStateStore::new(manager.pool().clone())),
        ),
    ]
}

fn hello_task(task_id: &str) -> NewTask {
    NewTask::new(task_id, "192.168.1.100", "hello.py", "print('hi')")
}

fn completed(stdout: &str) -> TaskTransition {
    TaskTransition::Succeed(ExecutionResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    })
}

#[tokio::test]
async fn test_create_then_get_returns_queued_record() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();

        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued, "{backend}");
        assert_eq!(task.host, "192.168.1.100", "{backend}");
        assert_eq!(task.script_name, "hello.py", "{backend}");
        assert!(task.started_at.is_none(), "{backend}");
        assert!(task.result.is_none() && task.error.is_none(), "{backend}");
    }
}

#[tokio::test]
async fn test_get_unknown_id_is_not_found() {
    for (backend, store) in stores().await {
        let result = store.get("nonexistent-id").await;
        assert!(
            matches!(result, Err(RunnerError::TaskNotFound { ref task_id }) if task_id == "nonexistent-id"),
            "{backend}: {result:?}"
        );
    }
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();
        let result = store.create(hello_task("task-1")).await;
        assert!(
            matches!(result, Err(RunnerError::DuplicateTask { .. })),
            "{backend}"
        );
    }
}

#[tokio::test]
async fn test_success_path_sets_timestamps_once() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();

        let running = store.transition("task-1", TaskTransition::Start).await.unwrap();
        let done = store.transition("task-1", completed("hi\n")).await.unwrap();

        assert_eq!(done.status, TaskStatus::Success, "{backend}");
        assert_eq!(done.started_at, running.started_at, "{backend}");
        assert!(done.completed_at.is_some(), "{backend}");
        assert_eq!(
            done.result.as_ref().map(|r| r.stdout.as_str()),
            Some("hi\n"),
            "{backend}"
        );
        assert!(done.error.is_none(), "{backend}");
    }
}

#[tokio::test]
async fn test_queued_task_can_fail_directly() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();

        let failed = store
            .transition(
                "task-1",
                TaskTransition::Fail(FailureDetail::new(
                    FailureKind::UnexpectedFailure,
                    "failed to enqueue task",
                )),
            )
            .await
            .unwrap();

        assert_eq!(failed.status, TaskStatus::Failure, "{backend}");
        assert!(failed.result.is_none(), "{backend}");
        assert_eq!(
            failed.error.map(|e| e.kind),
            Some(FailureKind::UnexpectedFailure),
            "{backend}"
        );
    }
}

#[tokio::test]
async fn test_terminal_tasks_reject_every_transition() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();
        store.transition("task-1", TaskTransition::Start).await.unwrap();
        store.transition("task-1", completed("hi\n")).await.unwrap();

        let attempts = vec![
            TaskTransition::Start,
            completed("again"),
            TaskTransition::Fail(FailureDetail::new(FailureKind::TimeoutFailure, "late")),
        ];
        for attempt in attempts {
            let result = store.transition("task-1", attempt).await;
            assert!(
                matches!(result, Err(RunnerError::InvalidTransition { .. })),
                "{backend}: {result:?}"
            );
        }

        // 被拒绝的转换不修改记录
        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Success, "{backend}");
        assert_eq!(
            task.result.map(|r| r.stdout),
            Some("hi\n".to_string()),
            "{backend}"
        );
    }
}

#[tokio::test]
async fn test_concurrent_terminal_writes_have_one_winner() {
    for (backend, store) in stores().await {
        store.create(hello_task("task-1")).await.unwrap();
        store.transition("task-1", TaskTransition::Start).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let transition = if i % 2 == 0 {
                    completed(&format!("writer {i}"))
                } else {
                    TaskTransition::Fail(FailureDetail::new(
                        FailureKind::ExecutionFailure,
                        format!("writer {i}"),
                    ))
                };
                store.transition("task-1", transition).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(RunnerError::InvalidTransition { .. }) => {}
                Err(e) => panic!("{backend}: unexpected error {e}"),
            }
        }
        assert_eq!(winners, 1, "{backend}");
        assert!(store.get("task-1").await.unwrap().is_terminal(), "{backend}");
    }
}
