//! Test helper utilities for asynchronous assertions

use runner_domain::entities::Task;
use runner_domain::repositories::TaskStateStore;
use std::time::Duration;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Poll the store until the task reaches `success` or `failure`
    pub async fn wait_for_terminal(
        store: &dyn TaskStateStore,
        task_id: &str,
        timeout: Duration,
    ) -> Option<Task> {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if let Ok(task) = store.get(task_id).await {
                if task.is_terminal() {
                    return Some(task);
                }
            }
            sleep(Duration::from_millis(20)).await;
        }

        None
    }
}
