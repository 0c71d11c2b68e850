use std::sync::Arc;

use runner_config::DatabaseConfig;
use runner_domain::{Message, MessageQueue};
use runner_infrastructure::{DatabaseManager, InMemoryMessageQueue, SqliteMessageQueue};
use runner_testing_utils::TaskExecutionMessageBuilder;

const QUEUE: &str = "default";

/// 两种队列实现必须满足同一份契约
async fn queues() -> Vec<(&'static str, Arc<dyn MessageQueue>)> {
    let config = DatabaseConfig {
        url: Some("sqlite::memory:".to_string()),
        max_connections: 1,
    };
    let manager = DatabaseManager::new(&config).await.unwrap();

    let queues: Vec<(&'static str, Arc<dyn MessageQueue>)> = vec![
        ("in-memory", Arc::new(InMemoryMessageQueue::new())),
        (
            "sqlite",
            Arc::new(SqliteMessageQueue::new(manager.pool().clone())),
        ),
    ];
    for (_, queue) in &queues {
        queue.create_queue(QUEUE, true).await.unwrap();
    }
    queues
}

fn message(task_id: &str) -> Message {
    TaskExecutionMessageBuilder::new()
        .with_task_id(task_id)
        .build_message()
}

fn task_ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.task.task_id.as_str()).collect()
}

#[tokio::test]
async fn test_messages_are_consumed_in_publish_order() {
    for (name, queue) in queues().await {
        queue.publish_message(QUEUE, &message("task-1")).await.unwrap();
        queue.publish_message(QUEUE, &message("task-2")).await.unwrap();
        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 2, "{name}");

        let consumed = queue.consume_messages(QUEUE, 10).await.unwrap();
        assert_eq!(task_ids(&consumed), vec!["task-1", "task-2"], "{name}");
        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 0, "{name}");
        assert!(queue.consume_messages(QUEUE, 10).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_acked_message_is_gone_for_good() {
    for (name, queue) in queues().await {
        let msg = message("task-1");
        queue.publish_message(QUEUE, &msg).await.unwrap();
        queue.consume_messages(QUEUE, 1).await.unwrap();

        queue.ack_message(&msg.id).await.unwrap();
        // 已确认的消息再 nack 不会复活
        queue.nack_message(&msg.id, true).await.unwrap();

        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 0, "{name}");
        assert!(queue.consume_messages(QUEUE, 1).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers_with_incremented_retry_count() {
    for (name, queue) in queues().await {
        let msg = message("task-1");
        queue.publish_message(QUEUE, &msg).await.unwrap();
        queue.consume_messages(QUEUE, 1).await.unwrap();

        queue.nack_message(&msg.id, true).await.unwrap();
        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 1, "{name}");

        let redelivered = queue.consume_messages(QUEUE, 1).await.unwrap();
        assert_eq!(redelivered.len(), 1, "{name}");
        assert_eq!(redelivered[0].id, msg.id, "{name}");
        assert_eq!(redelivered[0].retry_count, 1, "{name}");
    }
}

#[tokio::test]
async fn test_nack_without_requeue_drops_the_message() {
    for (name, queue) in queues().await {
        let msg = message("task-1");
        queue.publish_message(QUEUE, &msg).await.unwrap();
        queue.consume_messages(QUEUE, 1).await.unwrap();

        queue.nack_message(&msg.id, false).await.unwrap();

        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 0, "{name}");
        assert!(queue.consume_messages(QUEUE, 1).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_purge_removes_only_pending_messages() {
    for (name, queue) in queues().await {
        let in_flight = message("task-1");
        queue.publish_message(QUEUE, &in_flight).await.unwrap();
        queue.consume_messages(QUEUE, 1).await.unwrap();
        queue.publish_message(QUEUE, &message("task-2")).await.unwrap();

        queue.purge_queue(QUEUE).await.unwrap();
        assert_eq!(queue.get_queue_size(QUEUE).await.unwrap(), 0, "{name}");

        // 在途消息仍可被 nack 重新入队
        queue.nack_message(&in_flight.id, true).await.unwrap();
        let redelivered = queue.consume_messages(QUEUE, 10).await.unwrap();
        assert_eq!(task_ids(&redelivered), vec!["task-1"], "{name}");
    }
}
