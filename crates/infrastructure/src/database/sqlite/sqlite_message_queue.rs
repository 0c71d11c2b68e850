use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use runner_domain::entities::Message;
use runner_domain::messaging::MessageQueue;
use runner_errors::{RunnerError, RunnerResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument, warn};

/// 被取走但迟迟没有确认的消息，超过这个时间后可以被再次消费
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// 基于 SQLite 的持久化任务队列
///
/// 与任务状态存储共用同一个数据库文件，`submit` 与 `serve` 可以是不同的进程。
/// 取消息是一条 `UPDATE .. RETURNING`，多个消费者之间不会重复领取；
/// 持有消息的进程崩溃后，消息在 `claim_timeout` 之后重新可见。
pub struct SqliteMessageQueue {
    pool: SqlitePool,
    claim_timeout: Duration,
}

impl SqliteMessageQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// 已被取走尚未确认的消息数
    pub async fn claimed_count(&self, queue: &str) -> RunnerResult<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS size FROM queue_messages WHERE queue = ? AND claimed_at IS NOT NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        count_column(&row)
    }

    async fn insert(&self, queue: &str, message: &Message) -> RunnerResult<()> {
        let payload = serde_json::to_string(message)?;
        let result = sqlx::query(
            "INSERT INTO queue_messages (message_id, queue, payload) VALUES (?, ?, ?)",
        )
        .bind(&message.id)
        .bind(queue)
        .bind(payload)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                RunnerError::MessageQueue(format!("message {} already queued", message.id)),
            ),
            Err(e) => Err(RunnerError::Database(e)),
        }
    }
}

fn count_column(row: &sqlx::sqlite::SqliteRow) -> RunnerResult<u32> {
    let size: i64 = row.try_get("size")?;
    Ok(u32::try_from(size).unwrap_or(u32::MAX))
}

#[async_trait]
impl MessageQueue for SqliteMessageQueue {
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn publish_message(&self, queue: &str, message: &Message) -> RunnerResult<()> {
        self.insert(queue, message).await?;
        debug!("Published message {} to queue '{}'", message.id, queue);
        Ok(())
    }

    async fn consume_messages(&self, queue: &str, max_messages: usize) -> RunnerResult<Vec<Message>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let claim_timeout = i64::try_from(self.claim_timeout.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now.saturating_sub(claim_timeout);
        let limit = i64::try_from(max_messages).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            UPDATE queue_messages SET claimed_at = ?
            WHERE seq IN (
                SELECT seq FROM queue_messages
                WHERE queue = ? AND (claimed_at IS NULL OR claimed_at < ?)
                ORDER BY seq
                LIMIT ?
            )
            RETURNING seq, payload
            "#,
        )
        .bind(now)
        .bind(queue)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(|row| -> RunnerResult<(i64, String)> {
                Ok((row.try_get("seq")?, row.try_get("payload")?))
            })
            .collect::<RunnerResult<Vec<_>>>()?;
        claimed.sort_by_key(|(seq, _)| *seq);

        let messages = claimed
            .into_iter()
            .map(|(_, payload)| serde_json::from_str::<Message>(&payload).map_err(RunnerError::from))
            .collect::<RunnerResult<Vec<_>>>()?;

        if !messages.is_empty() {
            debug!("Consumed {} messages from queue '{}'", messages.len(), queue);
        }
        Ok(messages)
    }

    async fn ack_message(&self, message_id: &str) -> RunnerResult<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("Ack for unknown or already acknowledged message {}", message_id);
        }
        Ok(())
    }

    /// 重新入队是同一事务里的删除和插入，消息排到队尾；插入失败时整体回滚，消息保持已领取
    async fn nack_message(&self, message_id: &str, requeue: bool) -> RunnerResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "DELETE FROM queue_messages WHERE message_id = ? AND claimed_at IS NOT NULL \
             RETURNING queue, payload",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            warn!("Nack for unknown or unclaimed message {}", message_id);
            return Ok(());
        };
        let queue: String = row.try_get("queue")?;

        if requeue {
            let payload: String = row.try_get("payload")?;
            let mut message: Message = serde_json::from_str(&payload)?;
            message.retry_count += 1;
            sqlx::query(
                "INSERT INTO queue_messages (message_id, queue, payload) VALUES (?, ?, ?)",
            )
            .bind(message_id)
            .bind(&queue)
            .bind(serde_json::to_string(&message)?)
            .execute(&mut *tx)
            .await?;
            info!(
                "Requeueing message {} to '{}' (retry_count: {})",
                message_id, queue, message.retry_count
            );
        } else {
            warn!("Message {} dropped after nack", message_id);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_queue(&self, queue: &str, durable: bool) -> RunnerResult<()> {
        debug!("Queue '{}' is implicit in queue_messages (durable: {})", queue, durable);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> RunnerResult<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        info!(
            "Deleted queue '{}' ({} messages removed)",
            queue,
            result.rows_affected()
        );
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> RunnerResult<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS size FROM queue_messages WHERE queue = ? AND claimed_at IS NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        count_column(&row)
    }

    async fn purge_queue(&self, queue: &str) -> RunnerResult<()> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE queue = ? AND claimed_at IS NULL")
                .bind(queue)
                .execute(&self.pool)
                .await?;
        info!(
            "Purged {} messages from queue '{}'",
            result.rows_affected(),
            queue
        );
        Ok(())
    }
}
