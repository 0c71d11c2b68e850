use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use runner_config::AppConfig;
use runner_domain::{
    DeploymentOutcome, MessageQueue, SubmitTaskRequest, Task, TaskStateStore,
    TaskSubmissionService,
};
use runner_infrastructure::BackendFactory;
use runner_remote::{
    DeploymentSettings, OpenSshConnector, RemoteConnector, ScriptDeployer, SshCredentials,
};
use runner_worker::{TaskRunner, WorkerLifecycle, WriteRetryPolicy};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

/// 待提交的脚本
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub script_name: String,
    pub script_content: String,
}

/// 主应用程序：按配置装配存储、队列、部署协议与工作池
pub struct Application {
    config: AppConfig,
    store: Arc<dyn TaskStateStore>,
    queue: Arc<dyn MessageQueue>,
    shared_backend: bool,
    deployer: Arc<ScriptDeployer>,
    submission: TaskSubmissionService,
    worker: WorkerLifecycle,
}

impl Application {
    /// 使用系统 OpenSSH 客户端作为远程会话驱动
    pub async fn new(config: AppConfig) -> Result<Self> {
        let connector = Arc::new(OpenSshConnector::from(&config.ssh));
        Self::with_connector(config, connector).await
    }

    pub async fn with_connector(
        config: AppConfig,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Self> {
        info!("初始化应用程序，worker: {}", config.worker.worker_id);

        let backends = BackendFactory::create(&config.database)
            .await
            .context("创建任务存储与队列失败")?;
        let store = backends.store;
        let queue = backends.queue;
        queue
            .create_queue(&config.worker.task_queue, true)
            .await
            .context("创建任务队列失败")?;

        // 凭据在启动时一次性解析
        let credentials = SshCredentials::from(&config.ssh);
        let settings = DeploymentSettings::from_config(&config.ssh, &config.deployment);
        let deployer = Arc::new(ScriptDeployer::new(connector, credentials, settings));

        let submission = TaskSubmissionService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.worker.task_queue.clone(),
        );
        let runner = Arc::new(
            TaskRunner::new(
                config.worker.worker_id.clone(),
                Arc::clone(&store),
                Arc::clone(&deployer),
            )
            .with_write_retry(WriteRetryPolicy::from_config(&config.worker)),
        );
        let worker = WorkerLifecycle::new(&config.worker, Arc::clone(&queue), runner);

        Ok(Self {
            config,
            store,
            queue,
            shared_backend: backends.shared,
            deployer,
            submission,
            worker,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStateStore> {
        &self.store
    }

    pub fn submission(&self) -> &TaskSubmissionService {
        &self.submission
    }

    /// 存储和队列是否保存在其他进程也能访问的数据库中
    pub fn is_shared_backend(&self) -> bool {
        self.shared_backend
    }

    /// 运行工作池直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Worker服务: {}", self.config.worker.worker_id);
        self.worker.start().await?;

        let _ = shutdown_rx.recv().await;
        info!("Worker收到关闭信号");

        self.worker.stop().await?;
        info!("Worker服务已停止");
        Ok(())
    }

    /// 直接执行一次部署协议，不经过存储和队列
    pub async fn exec_once(
        &self,
        host: &str,
        script: &ScriptSource,
        timeout: Option<Duration>,
    ) -> DeploymentOutcome {
        let timeout = timeout.unwrap_or(self.deployer.settings().execution_timeout);
        self.deployer
            .deploy_and_run(host, &script.script_content, &script.script_name, timeout)
            .await
    }

    /// 登记并入队一批脚本，返回 `queued` 状态的任务记录
    pub async fn submit_scripts(&self, host: &str, scripts: Vec<ScriptSource>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(scripts.len());
        for script in scripts {
            let task = self
                .submission
                .submit(SubmitTaskRequest::new(
                    host,
                    script.script_name.clone(),
                    script.script_content,
                ))
                .await
                .with_context(|| format!("提交脚本失败: {}", script.script_name))?;
            info!("已提交任务 {} ({})", task.task_id, task.script_name);
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// 按顺序查询任务记录
    pub async fn task_status(&self, task_ids: &[String]) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let task = self
                .submission
                .status(task_id)
                .await
                .with_context(|| format!("查询任务失败: {task_id}"))?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// 经完整流水线提交一批脚本，等待全部进入终态后返回任务记录
    pub async fn run_batch(&self, host: &str, scripts: Vec<ScriptSource>) -> Result<Vec<Task>> {
        let task_ids: Vec<String> = self
            .submit_scripts(host, scripts)
            .await?
            .into_iter()
            .map(|task| task.task_id)
            .collect();

        self.worker.start().await?;
        let result = self.wait_for_terminal(&task_ids).await;
        if let Err(e) = self.worker.stop().await {
            warn!("停止工作池失败: {}", e);
        }
        result
    }

    /// 轮询直到全部任务进入终态
    ///
    /// 进程内后端下，队列为空且没有在途任务时仍未结束的任务不会再有进展，直接报错返回。
    /// 共享数据库时其他进程的工作池也可能持有这些任务，只能继续等待。
    async fn wait_for_terminal(&self, task_ids: &[String]) -> Result<Vec<Task>> {
        let poll_interval = self.config.worker.poll_interval();
        let mut idle_rounds = 0;
        loop {
            let tasks = self.task_status(task_ids).await?;
            if tasks.iter().all(Task::is_terminal) {
                return Ok(tasks);
            }

            let idle = !self.shared_backend
                && self.worker.in_flight() == 0
                && self.pending_messages().await? == 0;
            idle_rounds = if idle { idle_rounds + 1 } else { 0 };
            // 连续两轮空闲才判定，避开取消息与许可释放之间的窗口
            if idle_rounds >= 2 {
                let stuck: Vec<&str> = tasks
                    .iter()
                    .filter(|task| !task.is_terminal())
                    .map(|task| task.task_id.as_str())
                    .collect();
                bail!("队列已空且没有在途任务，以下任务未能进入终态: {}", stuck.join(", "));
            }
            sleep(poll_interval).await;
        }
    }

    /// 队列中尚未被取走的消息数
    pub async fn pending_messages(&self) -> Result<u32> {
        self.queue
            .get_queue_size(&self.config.worker.task_queue)
            .await
            .context("读取队列长度失败")
    }
}
