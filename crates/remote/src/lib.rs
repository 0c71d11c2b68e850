//! # Runner Remote
//!
//! 远程会话驱动（`RemoteConnector` / `RemoteSession`，OpenSSH 实现）
//! 与脚本部署协议（`ScriptDeployer`）。

pub mod openssh;
pub mod operations;
pub mod protocol;
pub mod session;

pub use openssh::{OpenSshConnector, OpenSshSession};
pub use operations::RemoteOperations;
pub use protocol::{DeploymentSettings, ScriptDeployer};
pub use session::{
    CommandOutput, RemoteConnector, RemoteSession, SessionError, SessionResult, SshCredentials,
};
