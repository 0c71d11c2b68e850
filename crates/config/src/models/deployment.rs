use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 远端部署约定：临时目录、解释器以及各步骤的超时
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentConfig {
    pub scratch_dir: String,
    pub interpreter: String,
    pub execution_timeout_seconds: u64,
    /// mkdir / rm 这类短命令的超时
    pub command_timeout_seconds: u64,
    pub transfer_timeout_seconds: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            scratch_dir: "/tmp/atriz_run/".to_string(),
            interpreter: "python3".to_string(),
            execution_timeout_seconds: 60,
            command_timeout_seconds: 30,
            transfer_timeout_seconds: 60,
        }
    }
}

impl DeploymentConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_seconds)
    }
}

impl ConfigValidator for DeploymentConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_remote_dir(&self.scratch_dir, "deployment.scratch_dir")?;
        ValidationUtils::validate_not_empty(&self.interpreter, "deployment.interpreter")?;
        ValidationUtils::validate_timeout_seconds(
            self.execution_timeout_seconds,
            "deployment.execution_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.command_timeout_seconds,
            "deployment.command_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.transfer_timeout_seconds,
            "deployment.transfer_timeout_seconds",
        )?;
        Ok(())
    }
}
