use async_trait::async_trait;
use runner_domain::entities::Message;
use runner_domain::messaging::MessageQueue;
use runner_errors::{RunnerError, RunnerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// 内存消息队列实现
///
/// 使用 Tokio channels 实现的进程内队列，适用于单进程部署。
/// 消费出的消息在确认前记录在未确认表中，`nack_message(.., true)`
/// 会把消息放回原队列，保证至少一次投递。
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    /// 队列存储：队列名 -> (发送端, 接收端)
    queues: Arc<RwLock<HashMap<String, QueueChannels>>>,
    /// 已消费未确认的消息：消息ID -> (队列名, 消息)
    unacked: Arc<Mutex<HashMap<String, (String, Message)>>>,
    config: InMemoryQueueConfig,
}

#[derive(Debug)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    /// 待消费的消息数
    size: Arc<AtomicU32>,
    durable: bool,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 队列最大容量（0表示无限制）
    pub max_queue_size: u32,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("Creating in-memory message queue with config: {:?}", config);
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// 已消费但尚未确认的消息数
    pub async fn unacked_count(&self) -> usize {
        self.unacked.lock().await.len()
    }

    /// 获取或创建队列通道
    async fn get_or_create_queue(&self, queue_name: &str, durable: bool) {
        let mut queues = self.queues.write().await;

        if !queues.contains_key(queue_name) {
            debug!("Creating new queue: {}", queue_name);
            let (sender, receiver) = mpsc::unbounded_channel();
            queues.insert(
                queue_name.to_string(),
                QueueChannels {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                    size: Arc::new(AtomicU32::new(0)),
                    durable,
                },
            );
            info!("Created queue '{}' (durable: {})", queue_name, durable);
        }
    }

    /// 把消息放入队列，容量检查与计数在这里统一处理
    async fn enqueue(&self, queue: &str, message: Message) -> RunnerResult<()> {
        self.get_or_create_queue(queue, false).await;

        let queues = self.queues.read().await;
        let channels = queues.get(queue).ok_or_else(|| queue_not_found(queue))?;

        let max = self.config.max_queue_size;
        if max > 0 && channels.size.load(Ordering::Relaxed) >= max {
            warn!("Queue '{}' is full ({} messages), message rejected", queue, max);
            return Err(RunnerError::MessageQueue(format!(
                "Queue '{queue}' is full"
            )));
        }

        let message_id = message.id.clone();
        channels.sender.send(message).map_err(|e| {
            RunnerError::MessageQueue(format!("Failed to send message to queue '{queue}': {e}"))
        })?;
        channels.size.fetch_add(1, Ordering::Relaxed);

        debug!("Enqueued message {} to queue '{}'", message_id, queue);
        Ok(())
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_not_found(queue: &str) -> RunnerError {
    RunnerError::MessageQueue(format!("Queue '{queue}' not found"))
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> RunnerResult<()> {
        debug!("Publishing message to queue '{}': {}", queue, message.id);
        self.enqueue(queue, message.clone()).await
    }

    async fn consume_messages(&self, queue: &str, max_messages: usize) -> RunnerResult<Vec<Message>> {
        self.get_or_create_queue(queue, false).await;

        let (receiver, size) = {
            let queues = self.queues.read().await;
            let channels = queues.get(queue).ok_or_else(|| queue_not_found(queue))?;
            (channels.receiver.clone(), channels.size.clone())
        };

        let mut messages = Vec::new();
        {
            let mut rx = receiver.lock().await;
            while messages.len() < max_messages {
                match rx.try_recv() {
                    Ok(message) => {
                        size.fetch_sub(1, Ordering::Relaxed);
                        messages.push(message);
                    }
                    Err(_) => break,
                }
            }
        }

        if !messages.is_empty() {
            let mut unacked = self.unacked.lock().await;
            for message in &messages {
                unacked.insert(message.id.clone(), (queue.to_string(), message.clone()));
            }
            debug!("Consumed {} messages from queue '{}'", messages.len(), queue);
        }

        Ok(messages)
    }

    async fn ack_message(&self, message_id: &str) -> RunnerResult<()> {
        debug!("Acknowledging message: {}", message_id);
        if self.unacked.lock().await.remove(message_id).is_none() {
            warn!("Ack for unknown or already acknowledged message {}", message_id);
        }
        Ok(())
    }

    async fn nack_message(&self, message_id: &str, requeue: bool) -> RunnerResult<()> {
        debug!(
            "Negative acknowledging message: {} (requeue: {})",
            message_id, requeue
        );

        let entry = self.unacked.lock().await.remove(message_id);
        let Some((queue, mut message)) = entry else {
            warn!("Nack for unknown or already acknowledged message {}", message_id);
            return Ok(());
        };

        if requeue {
            message.retry_count += 1;
            info!(
                "Requeueing message {} to '{}' (retry_count: {})",
                message_id, queue, message.retry_count
            );
            if let Err(e) = self.enqueue(&queue, message.clone()).await {
                // 入队失败时放回未确认表
                message.retry_count -= 1;
                self.unacked
                    .lock()
                    .await
                    .insert(message_id.to_string(), (queue, message));
                return Err(e);
            }
        } else {
            warn!("Message {} dropped after nack", message_id);
        }

        Ok(())
    }

    async fn create_queue(&self, queue: &str, durable: bool) -> RunnerResult<()> {
        info!("Creating queue '{}' (durable: {})", queue, durable);
        self.get_or_create_queue(queue, durable).await;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> RunnerResult<()> {
        info!("Deleting queue '{}'", queue);

        let mut queues = self.queues.write().await;
        match queues.remove(queue) {
            Some(channels) => info!(
                "Successfully deleted queue '{}' (durable: {})",
                queue, channels.durable
            ),
            None => warn!("Queue '{}' not found for deletion", queue),
        }

        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> RunnerResult<u32> {
        let queues = self.queues.read().await;
        let size = queues
            .get(queue)
            .map(|channels| channels.size.load(Ordering::Relaxed))
            .ok_or_else(|| queue_not_found(queue))?;

        debug!("Queue '{}' size: {}", queue, size);
        Ok(size)
    }

    async fn purge_queue(&self, queue: &str) -> RunnerResult<()> {
        info!("Purging queue '{}'", queue);

        let (receiver, size) = {
            let queues = self.queues.read().await;
            let channels = queues.get(queue).ok_or_else(|| queue_not_found(queue))?;
            (channels.receiver.clone(), channels.size.clone())
        };

        let mut purged_count = 0;
        {
            let mut rx = receiver.lock().await;
            while rx.try_recv().is_ok() {
                purged_count += 1;
            }
        }
        size.store(0, Ordering::Relaxed);

        info!("Purged {} messages from queue '{}'", purged_count, queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_domain::entities::TaskExecutionMessage;

    fn create_test_message(task_id: &str) -> Message {
        Message::task_execution(TaskExecutionMessage {
            task_id: task_id.to_string(),
            host: "192.168.1.100".to_string(),
            script_name: "hello.py".to_string(),
            script_content: "print('hi')".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let queue = InMemoryMessageQueue::new();
        let message = create_test_message("task-1");

        queue.publish_message("default", &message).await.unwrap();
        assert_eq!(queue.get_queue_size("default").await.unwrap(), 1);

        let consumed = queue.consume_messages("default", 10).await.unwrap();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].id, message.id);
        assert_eq!(queue.get_queue_size("default").await.unwrap(), 0);
        assert_eq!(queue.unacked_count().await, 1);
    }

    #[tokio::test]
    async fn test_consume_respects_max_messages() {
        let queue = InMemoryMessageQueue::new();
        for i in 0..5 {
            queue
                .publish_message("default", &create_test_message(&format!("task-{i}")))
                .await
                .unwrap();
        }

        let first = queue.consume_messages("default", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].task.task_id, "task-0");
        assert_eq!(queue.get_queue_size("default").await.unwrap(), 3);

        let none = queue.consume_messages("default", 0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_unacked_message() {
        let queue = InMemoryMessageQueue::new();
        let message = create_test_message("task-1");
        queue.publish_message("default", &message).await.unwrap();
        queue.consume_messages("default", 1).await.unwrap();

        queue.ack_message(&message.id).await.unwrap();
        assert_eq!(queue.unacked_count().await, 0);

        // 重复确认不报错
        queue.ack_message(&message.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let queue = InMemoryMessageQueue::new();
        let message = create_test_message("task-1");
        queue.publish_message("default", &message).await.unwrap();
        queue.consume_messages("default", 1).await.unwrap();

        queue.nack_message(&message.id, true).await.unwrap();
        assert_eq!(queue.get_queue_size("default").await.unwrap(), 1);

        let redelivered = queue.consume_messages("default", 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, message.id);
        assert_eq!(redelivered[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let queue = InMemoryMessageQueue::new();
        let message = create_test_message("task-1");
        queue.publish_message("default", &message).await.unwrap();
        queue.consume_messages("default", 1).await.unwrap();

        queue.nack_message(&message.id, false).await.unwrap();
        assert_eq!(queue.get_queue_size("default").await.unwrap(), 0);
        assert_eq!(queue.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let queue = InMemoryMessageQueue::with_config(InMemoryQueueConfig { max_queue_size: 1 });
        queue
            .publish_message("default", &create_test_message("task-1"))
            .await
            .unwrap();

        let result = queue
            .publish_message("default", &create_test_message("task-2"))
            .await;
        assert!(matches!(result, Err(RunnerError::MessageQueue(_))));
    }

    #[tokio::test]
    async fn test_failed_requeue_keeps_message_unacked() {
        let queue = InMemoryMessageQueue::with_config(InMemoryQueueConfig { max_queue_size: 1 });
        let first = create_test_message("task-1");
        queue.publish_message("default", &first).await.unwrap();
        queue.consume_messages("default", 1).await.unwrap();
        queue
            .publish_message("default", &create_test_message("task-2"))
            .await
            .unwrap();

        let result = queue.nack_message(&first.id, true).await;
        assert!(matches!(result, Err(RunnerError::MessageQueue(_))));
        assert_eq!(queue.unacked_count().await, 1);

        // 腾出空间后同一条消息仍可重新入队
        let second = queue.consume_messages("default", 1).await.unwrap();
        queue.ack_message(&second[0].id).await.unwrap();
        queue.nack_message(&first.id, true).await.unwrap();

        let redelivered = queue.consume_messages("default", 1).await.unwrap();
        assert_eq!(redelivered[0].id, first.id);
        assert_eq!(redelivered[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_queue_management() {
        let queue = InMemoryMessageQueue::new();

        queue.create_queue("robots", true).await.unwrap();
        assert_eq!(queue.get_queue_size("robots").await.unwrap(), 0);

        queue
            .publish_message("robots", &create_test_message("task-1"))
            .await
            .unwrap();
        queue.purge_queue("robots").await.unwrap();
        assert_eq!(queue.get_queue_size("robots").await.unwrap(), 0);

        queue.delete_queue("robots").await.unwrap();
        assert!(queue.get_queue_size("robots").await.is_err());
    }
}
