//! # 脚本部署协议
//!
//! 固定的步骤序列，每一步以上一步成功为前提：
//!
//! 1. 建立会话
//! 2. `mkdir -p <scratch_dir>`
//! 3. 上传脚本到 `<scratch_dir><script_name>`
//! 4. `<interpreter> <scratch_dir><script_name>`
//! 5. 只要会话建立过就尽力执行 `rm -rf <scratch_dir><script_name>`
//! 6. 关闭会话
//!
//! 协议不认识任务，只返回 `DeploymentOutcome`。远程失败都是值，不是错误。

use std::sync::Arc;
use std::time::Duration;

use runner_config::{DeploymentConfig, SshConfig};
use runner_domain::{validate_script_name, DeploymentOutcome, FailureDetail, FailureKind};
use tracing::{debug, info, warn};

use crate::session::{RemoteConnector, RemoteSession, SessionError, SshCredentials};

/// 远端约定与各步骤超时
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentSettings {
    pub scratch_dir: String,
    pub interpreter: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    pub execution_timeout: Duration,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self::from_config(&SshConfig::default(), &DeploymentConfig::default())
    }
}

impl DeploymentSettings {
    pub fn from_config(ssh: &SshConfig, deployment: &DeploymentConfig) -> Self {
        Self {
            scratch_dir: deployment.scratch_dir.clone(),
            interpreter: deployment.interpreter.clone(),
            connect_timeout: ssh.connect_timeout(),
            command_timeout: deployment.command_timeout(),
            transfer_timeout: deployment.transfer_timeout(),
            execution_timeout: deployment.execution_timeout(),
        }
    }

    pub fn remote_script_path(&self, script_name: &str) -> String {
        format!("{}{}", self.scratch_dir, script_name)
    }

    pub fn mkdir_command(&self) -> String {
        format!("mkdir -p {}", self.scratch_dir)
    }

    pub fn execute_command(&self, script_name: &str) -> String {
        format!(
            "{} {}",
            self.interpreter,
            self.remote_script_path(script_name)
        )
    }

    pub fn cleanup_command(&self, script_name: &str) -> String {
        format!("rm -rf {}", self.remote_script_path(script_name))
    }
}

pub struct ScriptDeployer {
    connector: Arc<dyn RemoteConnector>,
    credentials: SshCredentials,
    settings: DeploymentSettings,
}

impl ScriptDeployer {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        credentials: SshCredentials,
        settings: DeploymentSettings,
    ) -> Self {
        Self {
            connector,
            credentials,
            settings,
        }
    }

    pub fn settings(&self) -> &DeploymentSettings {
        &self.settings
    }

    /// 使用配置中的默认执行超时
    pub async fn deploy_and_run_default(
        &self,
        host: &str,
        script_content: &str,
        script_name: &str,
    ) -> DeploymentOutcome {
        self.deploy_and_run(
            host,
            script_content,
            script_name,
            self.settings.execution_timeout,
        )
        .await
    }

    /// 部署并执行脚本，`timeout` 只约束第 4 步
    pub async fn deploy_and_run(
        &self,
        host: &str,
        script_content: &str,
        script_name: &str,
        timeout: Duration,
    ) -> DeploymentOutcome {
        // 脚本名直接拼进远程命令，必须先确认是普通文件名
        if let Err(e) = validate_script_name(script_name) {
            return DeploymentOutcome::failed(FailureKind::DeployFailure, e.to_string());
        }

        let mut session = match self
            .connector
            .connect(host, &self.credentials, self.settings.connect_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                info!("无法连接远程主机: host={}, error={}", host, e);
                return DeploymentOutcome::failed(
                    FailureKind::ConnectionFailure,
                    format!("failed to connect to {host}: {e}"),
                );
            }
        };

        let outcome = self
            .run_steps(session.as_mut(), host, script_content, script_name, timeout)
            .await;

        self.cleanup(session.as_mut(), host, script_name).await;

        if let Err(e) = session.close().await {
            warn!("关闭会话失败: host={}, error={}", host, e);
        }

        outcome
    }

    async fn run_steps(
        &self,
        session: &mut dyn RemoteSession,
        host: &str,
        script_content: &str,
        script_name: &str,
        timeout: Duration,
    ) -> DeploymentOutcome {
        let mkdir = self.settings.mkdir_command();
        debug!("创建临时目录: host={}, command={}", host, mkdir);
        match session.run(&mkdir, self.settings.command_timeout).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return DeploymentOutcome::failed(
                    FailureKind::DeployFailure,
                    format!(
                        "`{mkdir}` exited with {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    ),
                );
            }
            Err(e) => return step_failure(e, FailureKind::DeployFailure),
        }

        let remote_path = self.settings.remote_script_path(script_name);
        debug!("上传脚本: host={}, path={}", host, remote_path);
        if let Err(e) = session
            .upload(
                script_content.as_bytes(),
                &remote_path,
                self.settings.transfer_timeout,
            )
            .await
        {
            return step_failure(e, FailureKind::DeployFailure);
        }

        let command = self.settings.execute_command(script_name);
        debug!("执行脚本: host={}, command={}", host, command);
        match session.run(&command, timeout).await {
            Ok(output) if output.success() => DeploymentOutcome::Completed {
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Ok(output) => {
                let detail = FailureDetail::new(
                    FailureKind::ExecutionFailure,
                    format!("script exited with code {}", output.exit_code),
                )
                .with_output(output.stdout, output.stderr);
                DeploymentOutcome::Failed(detail)
            }
            // 会话已建立后的传输错误视为连接中断
            Err(e) => step_failure(e, FailureKind::ConnectionFailure),
        }
    }

    async fn cleanup(&self, session: &mut dyn RemoteSession, host: &str, script_name: &str) {
        let command = self.settings.cleanup_command(script_name);
        match session.run(&command, self.settings.command_timeout).await {
            Ok(output) if output.success() => {
                debug!("清理完成: host={}, command={}", host, command);
            }
            Ok(output) => {
                warn!(
                    "CleanupFailure: host={}, command={}, exit_code={}, stderr={}",
                    host,
                    command,
                    output.exit_code,
                    output.stderr.trim()
                );
            }
            Err(e) => {
                warn!(
                    "CleanupFailure: host={}, command={}, error={}",
                    host, command, e
                );
            }
        }
    }
}

/// 超时一律归为 `TimeoutFailure`，其余错误归为该步骤的默认分类
fn step_failure(error: SessionError, kind: FailureKind) -> DeploymentOutcome {
    if error.is_timeout() {
        DeploymentOutcome::failed(FailureKind::TimeoutFailure, error.to_string())
    } else {
        DeploymentOutcome::failed(kind, error.to_string())
    }
}
