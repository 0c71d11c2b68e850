//! # OpenSSH 会话驱动
//!
//! 通过 `tokio::process` 调用系统 `ssh` 客户端。连接时启动一个 ControlMaster
//! 进程，控制套接字放在私有临时目录里，之后的命令与传输都复用这条连接。
//! 所有子进程都设置了 `kill_on_drop`，会话被丢弃时主连接随之终止，临时目录被删除。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use runner_config::SshConfig;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::session::{
    CommandOutput, RemoteConnector, RemoteSession, SessionError, SessionResult, SshCredentials,
};

/// ssh 自身出错（而不是远端命令）时的退出码
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_binary: String,
    strict_host_key_checking: bool,
}

impl OpenSshConnector {
    pub fn new(ssh_binary: impl Into<String>) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            strict_host_key_checking: false,
        }
    }

    pub fn with_strict_host_key_checking(mut self, enabled: bool) -> Self {
        self.strict_host_key_checking = enabled;
        self
    }

    fn common_args(&self, credentials: &SshCredentials) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            credentials.port.to_string(),
            "-l".to_string(),
            credentials.username.clone(),
        ];

        if let Some(key) = &credentials.private_key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        if !self.strict_host_key_checking {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ]);
        }

        args
    }
}

impl From<&SshConfig> for OpenSshConnector {
    fn from(config: &SshConfig) -> Self {
        Self::new(config.ssh_binary.clone())
            .with_strict_host_key_checking(config.strict_host_key_checking)
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    async fn connect(
        &self,
        host: &str,
        credentials: &SshCredentials,
        timeout: Duration,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        let control_dir = tempfile::Builder::new()
            .prefix("remote-runner-ssh-")
            .tempdir()
            .map_err(|e| SessionError::Connect(format!("无法创建控制目录: {e}")))?;
        let control_path = control_dir.path().join("control.sock");
        let common_args = self.common_args(credentials);
        let connect_timeout_secs = timeout.as_secs().max(1);

        debug!("启动 ssh 主连接: host={}, port={}", host, credentials.port);

        let mut master = Command::new(&self.ssh_binary)
            .args(&common_args)
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout_secs}"))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&control_path)
            .arg("--")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Connect(format!("无法启动 {}: {e}", self.ssh_binary)))?;

        let ready = tokio::time::timeout(
            timeout,
            wait_for_master(&self.ssh_binary, &mut master, &control_path, host),
        )
        .await;

        match ready {
            Ok(Ok(())) => {
                debug!("ssh 主连接就绪: host={}", host);
                let session: Box<dyn RemoteSession> = Box::new(OpenSshSession {
                    ssh_binary: self.ssh_binary.clone(),
                    host: host.to_string(),
                    common_args,
                    control_path,
                    master,
                    _control_dir: control_dir,
                });
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::timeout(format!("连接 {host}"), timeout)),
        }
    }
}

/// 等待主连接进程退出（失败）或控制套接字可用（成功）
async fn wait_for_master(
    ssh_binary: &str,
    master: &mut Child,
    control_path: &Path,
    host: &str,
) -> SessionResult<()> {
    loop {
        if let Some(status) = master
            .try_wait()
            .map_err(|e| SessionError::Connect(e.to_string()))?
        {
            let mut stderr = String::new();
            if let Some(mut pipe) = master.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let reason = stderr.trim();
            return Err(SessionError::Connect(if reason.is_empty() {
                format!("ssh 退出: {status}")
            } else {
                reason.to_string()
            }));
        }

        if control_path.exists() && control_check(ssh_binary, control_path, host).await {
            return Ok(());
        }

        tokio::time::sleep(MASTER_POLL_INTERVAL).await;
    }
}

async fn control_check(ssh_binary: &str, control_path: &Path, host: &str) -> bool {
    let mut cmd = control_command(ssh_binary, control_path, "check", host);

    matches!(
        tokio::time::timeout(CONTROL_TIMEOUT, cmd.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

/// `ssh -S <socket> -O <action> -- <host>`
fn control_command(ssh_binary: &str, control_path: &Path, action: &str, host: &str) -> Command {
    let mut cmd = Command::new(ssh_binary);
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg(action)
        .arg("--")
        .arg(host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

pub struct OpenSshSession {
    ssh_binary: String,
    host: String,
    common_args: Vec<String>,
    control_path: PathBuf,
    master: Child,
    // 最后释放：主连接先被 kill，再删除套接字目录
    _control_dir: TempDir,
}

impl OpenSshSession {
    fn client_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(&self.common_args)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-S")
            .arg(&self.control_path)
            .arg("--")
            .arg(&self.host)
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn master_alive(&mut self) -> bool {
        if matches!(self.master.try_wait(), Ok(Some(_)) | Err(_)) {
            return false;
        }
        control_check(&self.ssh_binary, &self.control_path, &self.host).await
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn run(&mut self, command: &str, timeout: Duration) -> SessionResult<CommandOutput> {
        debug!("执行远程命令: host={}, command={}", self.host, command);

        let child = self
            .client_command(command)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SessionError::Run(format!("无法启动 ssh: {e}")))?;

        // 超时后 child 随 future 一起被丢弃并被 kill
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SessionError::timeout(command, timeout))?
            .map_err(|e| SessionError::Run(e.to_string()))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        // 255 既可能是远端脚本的退出码，也可能是连接断开；主连接还活着就按前者处理
        if result.exit_code == SSH_TRANSPORT_EXIT_CODE && !self.master_alive().await {
            return Err(SessionError::Run(format!(
                "与 {} 的连接已断开: {}",
                self.host,
                result.stderr.trim()
            )));
        }

        Ok(result)
    }

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> SessionResult<()> {
        let quoted = shlex::try_quote(remote_path)
            .map_err(|e| SessionError::Transfer(format!("非法的远程路径 {remote_path}: {e}")))?;
        let remote_command = format!("cat > {quoted}");

        debug!(
            "上传文件: host={}, path={}, bytes={}",
            self.host,
            remote_path,
            content.len()
        );

        let mut child = self
            .client_command(&remote_command)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::Transfer(format!("无法启动 ssh: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Transfer("无法获取stdin".to_string()))?;

        let transfer = async move {
            stdin
                .write_all(content)
                .await
                .map_err(|e| SessionError::Transfer(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| SessionError::Transfer(e.to_string()))?;
            drop(stdin);
            child
                .wait_with_output()
                .await
                .map_err(|e| SessionError::Transfer(e.to_string()))
        };

        let output = tokio::time::timeout(timeout, transfer)
            .await
            .map_err(|_| SessionError::timeout(format!("上传 {remote_path}"), timeout))??;

        if !output.status.success() {
            return Err(SessionError::Transfer(format!(
                "写入 {} 失败: {}",
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    async fn download(&mut self, remote_path: &str, timeout: Duration) -> SessionResult<Vec<u8>> {
        let quoted = shlex::try_quote(remote_path)
            .map_err(|e| SessionError::Transfer(format!("非法的远程路径 {remote_path}: {e}")))?;

        debug!("下载文件: host={}, path={}", self.host, remote_path);

        let child = self
            .client_command(&format!("cat {quoted}"))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SessionError::Transfer(format!("无法启动 ssh: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SessionError::timeout(format!("下载 {remote_path}"), timeout))?
            .map_err(|e| SessionError::Transfer(e.to_string()))?;

        if !output.status.success() {
            return Err(SessionError::Transfer(format!(
                "读取 {} 失败: {}",
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }

    async fn close(mut self: Box<Self>) -> SessionResult<()> {
        let mut exit = control_command(&self.ssh_binary, &self.control_path, "exit", &self.host);

        let result = match tokio::time::timeout(CONTROL_TIMEOUT, exit.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(SessionError::Run(format!("ssh -O exit 返回 {status}"))),
            Ok(Err(e)) => Err(SessionError::Run(e.to_string())),
            Err(_) => Err(SessionError::timeout("ssh -O exit", CONTROL_TIMEOUT)),
        };

        if result.is_err() {
            warn!("主连接未能正常退出，强制终止: host={}", self.host);
            let _ = self.master.start_kill();
        }
        let _ = tokio::time::timeout(CONTROL_TIMEOUT, self.master.wait()).await;

        debug!("会话已关闭: host={}", self.host);
        result
    }
}
