use std::sync::Arc;
use std::time::Duration;

use runner_config::WorkerConfig;
use runner_domain::entities::Message;
use runner_domain::messaging::MessageQueue;
use runner_errors::{RunnerError, RunnerResult};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::task_execution::panic_message;
use super::{ExecutionReport, TaskRunner};

/// 工作池：轮询任务队列，用信号量限制同时在途的任务数
///
/// 取消息之前先拿到一个许可，许可随任务一直持有到终态写入并确认消息之后，
/// 因此在途任务数永远不会超过 `concurrency`。
pub struct WorkerLifecycle {
    worker_id: String,
    queue: Arc<dyn MessageQueue>,
    runner: Arc<TaskRunner>,
    task_queue: String,
    poll_interval: Duration,
    max_redeliveries: u32,
    concurrency: usize,
    permits: Arc<Semaphore>,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerLifecycle {
    pub fn new(config: &WorkerConfig, queue: Arc<dyn MessageQueue>, runner: Arc<TaskRunner>) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            worker_id: config.worker_id.clone(),
            queue,
            runner,
            task_queue: config.task_queue.clone(),
            poll_interval: config.poll_interval(),
            max_redeliveries: config.max_redeliveries,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
            poll_handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 当前在途的任务数
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn start(&self) -> RunnerResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(RunnerError::Internal(
                "Worker service already running".to_string(),
            ));
        }

        info!(
            "Starting worker service: {} (queue: {}, concurrency: {})",
            self.worker_id, self.task_queue, self.concurrency
        );
        self.queue.create_queue(&self.task_queue, true).await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let handle = self.start_task_polling(shutdown_rx);
        *self.poll_handle.lock().await = Some(handle);

        *is_running = true;
        info!("Worker service {} started successfully", self.worker_id);
        Ok(())
    }

    /// 停止轮询，并等待在途任务全部写入终态
    pub async fn stop(&self) -> RunnerResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!("停止worker服务: {}", self.worker_id);
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.poll_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("任务轮询循环异常退出: {}", e);
            }
        }

        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!("等待 {} 个在途任务完成", in_flight);
        }
        // 拿回全部许可即说明所有在途任务都已结束
        let permits = self
            .permits
            .acquire_many(self.concurrency as u32)
            .await
            .map_err(|e| RunnerError::Internal(format!("worker semaphore closed: {e}")))?;
        drop(permits);

        *is_running = false;
        info!("Worker服务 {} 已停止", self.worker_id);
        Ok(())
    }

    fn start_task_polling(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut poll_interval = interval(self.poll_interval);
        let queue = Arc::clone(&self.queue);
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let task_queue = self.task_queue.clone();
        let max_redeliveries = self.max_redeliveries;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_interval.tick() => {
                        if let Err(e) = Self::poll_and_execute_tasks(
                            &queue,
                            &runner,
                            &permits,
                            &task_queue,
                            max_redeliveries,
                        ).await {
                            error!("Task polling failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Task polling shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// 有空闲许可时逐条取消息，每条消息交给独立的 tokio 任务执行
    async fn poll_and_execute_tasks(
        queue: &Arc<dyn MessageQueue>,
        runner: &Arc<TaskRunner>,
        permits: &Arc<Semaphore>,
        task_queue: &str,
        max_redeliveries: u32,
    ) -> RunnerResult<()> {
        loop {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                debug!("所有执行槽位已占用，等待下一轮轮询");
                return Ok(());
            };

            let mut messages = queue.consume_messages(task_queue, 1).await?;
            let Some(message) = messages.pop() else {
                return Ok(());
            };

            tokio::spawn(Self::process_message(
                Arc::clone(queue),
                Arc::clone(runner),
                message,
                max_redeliveries,
                permit,
            ));
        }
    }

    /// 处理一条消息并决定确认方式
    ///
    /// `execute` 在独立的 tokio 任务里运行，panic 不会让消息停留在未确认状态。
    /// 协议开始前的可重试错误最多重新投递 `max_redeliveries` 次，
    /// 其余无法处理的情况把任务记为 `UnexpectedFailure` 后丢弃消息。
    async fn process_message(
        queue: Arc<dyn MessageQueue>,
        runner: Arc<TaskRunner>,
        message: Message,
        max_redeliveries: u32,
        _permit: OwnedSemaphorePermit,
    ) {
        let message_id = message.id.clone();
        let task_id = message.task.task_id.clone();
        let retry_count = u32::try_from(message.retry_count).unwrap_or(0);

        let request = message.task;
        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.execute(request).await })
        };

        let reason = match handle.await {
            Ok(Ok(report)) => {
                match &report {
                    ExecutionReport::Finished(task) => {
                        debug!("任务 {} 已写入终态 {}", task.task_id, task.status);
                    }
                    ExecutionReport::Unrecorded(outcome) => {
                        error!(
                            "任务 {} 的执行结果未能写入存储，不再重复执行: {:?}",
                            task_id, outcome
                        );
                    }
                    ExecutionReport::SkippedTerminal(_) | ExecutionReport::UnknownTask => {}
                }
                if let Err(e) = queue.ack_message(&message_id).await {
                    error!("Failed to acknowledge message {}: {}", message_id, e);
                }
                return;
            }
            Ok(Err(e)) if e.is_retryable() && retry_count < max_redeliveries => {
                warn!(
                    "任务 {} 处理失败，消息 {} 重新入队 (retry_count: {}/{}): {}",
                    task_id, message_id, retry_count, max_redeliveries, e
                );
                if let Err(e) = queue.nack_message(&message_id, true).await {
                    error!("Failed to requeue message {}: {}", message_id, e);
                }
                return;
            }
            Ok(Err(e)) => format!("task could not be processed after {retry_count} redeliveries: {e}"),
            Err(join_error) if join_error.is_panic() => {
                format!("task runner panicked: {}", panic_message(join_error.into_panic()))
            }
            Err(join_error) => format!("task runner aborted: {join_error}"),
        };

        error!("任务 {} 无法处理，记为失败并丢弃消息 {}: {}", task_id, message_id, reason);
        if let Err(e) = runner.abandon(&task_id, reason).await {
            error!("任务 {} 的失败记录写入失败: {}", task_id, e);
        }
        if let Err(e) = queue.nack_message(&message_id, false).await {
            error!("Failed to reject message {}: {}", message_id, e);
        }
    }
}
