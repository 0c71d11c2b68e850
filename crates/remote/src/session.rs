//! # 远程会话抽象
//!
//! `RemoteConnector` 打开会话，`RemoteSession` 在会话上执行命令和传输文件。
//! 每次调用都带各自的超时，超时以 `SessionError::Timeout` 返回，不做重试。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use runner_config::SshConfig;
use thiserror::Error;

/// 远程命令的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("连接失败: {0}")]
    Connect(String),

    #[error("命令执行失败: {0}")]
    Run(String),

    #[error("文件传输失败: {0}")]
    Transfer(String),

    #[error("{operation} 超时 ({}s)", .timeout.as_secs_f64())]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}

impl SessionError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// 登录远端所需的凭据，启动时从配置解析一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub username: String,
    pub private_key_path: Option<PathBuf>,
    pub port: u16,
}

impl SshCredentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key_path: None,
            port: 22,
        }
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl From<&SshConfig> for SshCredentials {
    fn from(config: &SshConfig) -> Self {
        Self {
            username: config.username.clone(),
            private_key_path: config.private_key_path.as_ref().map(PathBuf::from),
            port: config.port,
        }
    }
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// 建立会话；`timeout` 内未就绪返回 `SessionError::Timeout`
    async fn connect(
        &self,
        host: &str,
        credentials: &SshCredentials,
        timeout: Duration,
    ) -> SessionResult<Box<dyn RemoteSession>>;
}

/// 一个已建立的远程会话
///
/// 会话是有作用域的资源：`close` 正常关闭，直接丢弃也必须释放底层连接，
/// 包括仍在执行中的命令。
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &str, timeout: Duration) -> SessionResult<CommandOutput>;

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> SessionResult<()>;

    async fn download(&mut self, remote_path: &str, timeout: Duration) -> SessionResult<Vec<u8>>;

    async fn close(self: Box<Self>) -> SessionResult<()>;
}
