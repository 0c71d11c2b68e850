use crate::*;

#[test]
fn test_runner_error_display() {
    let not_found = RunnerError::task_not_found("nonexistent-id");
    assert_eq!(not_found.to_string(), "任务未找到: nonexistent-id");

    let duplicate = RunnerError::duplicate_task("task-1");
    assert_eq!(duplicate.to_string(), "任务已存在: task-1");

    let transition = RunnerError::invalid_transition("task-1", "success", "running");
    assert_eq!(
        transition.to_string(),
        "无效的状态转换: 任务 task-1 不能从 success 转换到 running"
    );

    let mq_error = RunnerError::MessageQueue("Queue 'default' not found".to_string());
    assert_eq!(
        mq_error.to_string(),
        "消息队列错误: Queue 'default' not found"
    );
}

#[test]
fn test_contract_violations() {
    assert!(RunnerError::task_not_found("a").is_contract_violation());
    assert!(RunnerError::duplicate_task("a").is_contract_violation());
    assert!(RunnerError::invalid_transition("a", "failure", "success").is_contract_violation());
    assert!(!RunnerError::MessageQueue("down".to_string()).is_contract_violation());
    assert!(!RunnerError::Internal("bug".to_string()).is_contract_violation());
}

#[test]
fn test_retryable_errors() {
    assert!(RunnerError::database_error("locked").is_retryable());
    assert!(RunnerError::MessageQueue("closed".to_string()).is_retryable());
    assert!(RunnerError::Timeout("store".to_string()).is_retryable());
    assert!(!RunnerError::task_not_found("a").is_retryable());
    assert!(!RunnerError::config_error("bad").is_retryable());
}

#[test]
fn test_from_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
    let err: RunnerError = json_err.into();
    assert!(matches!(err, RunnerError::Serialization(_)));

    let err: RunnerError = anyhow::anyhow!("boom").into();
    assert!(matches!(err, RunnerError::Internal(ref msg) if msg == "boom"));
}
