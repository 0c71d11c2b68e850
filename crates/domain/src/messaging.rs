use async_trait::async_trait;
use runner_errors::RunnerResult;

use crate::entities::Message;

/// 消息队列抽象接口
///
/// 投递语义为至少一次：消费出的消息在 `ack_message` 之前处于未确认状态，
/// `nack_message(.., true)` 会把它重新放回队列。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定队列
    async fn publish_message(&self, queue: &str, message: &Message) -> RunnerResult<()>;

    /// 从指定队列最多消费 `max_messages` 条消息，没有消息时返回空列表
    async fn consume_messages(&self, queue: &str, max_messages: usize)
        -> RunnerResult<Vec<Message>>;

    /// 确认消息处理完成
    async fn ack_message(&self, message_id: &str) -> RunnerResult<()>;

    /// 拒绝消息，`requeue` 为真时重新入队
    async fn nack_message(&self, message_id: &str, requeue: bool) -> RunnerResult<()>;

    /// 创建队列
    async fn create_queue(&self, queue: &str, durable: bool) -> RunnerResult<()>;

    /// 删除队列
    async fn delete_queue(&self, queue: &str) -> RunnerResult<()>;

    /// 获取队列中待消费的消息数量
    async fn get_queue_size(&self, queue: &str) -> RunnerResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> RunnerResult<()>;
}
