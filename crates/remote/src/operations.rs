//! 一次性远程操作：每次调用各自打开并关闭一个会话

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::protocol::DeploymentSettings;
use crate::session::{
    CommandOutput, RemoteConnector, RemoteSession, SessionError, SessionResult, SshCredentials,
};

pub struct RemoteOperations {
    connector: Arc<dyn RemoteConnector>,
    credentials: SshCredentials,
    settings: DeploymentSettings,
}

impl RemoteOperations {
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

    async fn open(&self, host: &str) -> SessionResult<Box<dyn RemoteSession>> {
        self.connector
            .connect(host, &self.credentials, self.settings.connect_timeout)
            .await
    }

    async fn finish<T>(
        host: &str,
        session: Box<dyn RemoteSession>,
        result: SessionResult<T>,
    ) -> SessionResult<T> {
        if let Err(e) = session.close().await {
            warn!("关闭会话失败: host={}, error={}", host, e);
        }
        result
    }

    /// 执行任意命令，非零退出码不视为错误，由调用方判断
    pub async fn execute_command(&self, host: &str, command: &str) -> SessionResult<CommandOutput> {
        let mut session = self.open(host).await?;
        let result = session.run(command, self.settings.command_timeout).await;
        Self::finish(host, session, result).await
    }

    /// 上传本地文件，先创建远端父目录
    pub async fn upload_file(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> SessionResult<()> {
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            SessionError::Transfer(format!("无法读取本地文件 {}: {e}", local_path.display()))
        })?;

        let mut session = self.open(host).await?;
        let result = async {
            if let Some(parent) = remote_parent_dir(remote_path) {
                let quoted = shlex::try_quote(parent).map_err(|e| {
                    SessionError::Transfer(format!("非法的远程路径 {parent}: {e}"))
                })?;
                let output = session
                    .run(&format!("mkdir -p {quoted}"), self.settings.command_timeout)
                    .await?;
                if !output.success() {
                    return Err(SessionError::Transfer(format!(
                        "无法创建远程目录 {parent}: {}",
                        output.stderr.trim()
                    )));
                }
            }
            session
                .upload(&content, remote_path, self.settings.transfer_timeout)
                .await
        }
        .await;

        if result.is_ok() {
            info!(
                "文件已上传: host={}, local={}, remote={}",
                host,
                local_path.display(),
                remote_path
            );
        }
        Self::finish(host, session, result).await
    }

    /// 下载远端文件到本地，返回写入的字节数
    pub async fn download_file(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> SessionResult<u64> {
        let mut session = self.open(host).await?;
        let result = session
            .download(remote_path, self.settings.transfer_timeout)
            .await;
        let content = Self::finish(host, session, result).await?;

        tokio::fs::write(local_path, &content).await.map_err(|e| {
            SessionError::Transfer(format!("无法写入本地文件 {}: {e}", local_path.display()))
        })?;

        info!(
            "文件已下载: host={}, remote={}, local={}",
            host,
            remote_path,
            local_path.display()
        );
        Ok(content.len() as u64)
    }
}

fn remote_parent_dir(remote_path: &str) -> Option<&str> {
    let trimmed = remote_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}
