use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// 同时在途的任务数
    pub concurrency: usize,
    pub task_queue: String,
    pub poll_interval_ms: u64,
    /// 任务开始前存储不可用时，消息最多重新投递的次数
    pub max_redeliveries: u32,
    /// 终态写入的最大尝试次数，结果已知时不会重新执行脚本
    pub terminal_write_attempts: u32,
    /// 终态写入重试的初始退避，之后每次翻倍
    pub terminal_write_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: 2,
            task_queue: "default".to_string(),
            poll_interval_ms: 200,
            max_redeliveries: 3,
            terminal_write_attempts: 5,
            terminal_write_backoff_ms: 200,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminal_write_backoff(&self) -> Duration {
        Duration::from_millis(self.terminal_write_backoff_ms)
    }
}

/// `runner@<hostname>`，取不到主机名时退回 `runner@localhost`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("runner@{host}")
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_id, "worker.worker_id")?;
        ValidationUtils::validate_count(self.concurrency, "worker.concurrency")?;
        ValidationUtils::validate_not_empty(&self.task_queue, "worker.task_queue")?;

        if self.terminal_write_attempts == 0 {
            return Err(crate::ConfigError::Validation(
                "worker.terminal_write_attempts must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "worker.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
